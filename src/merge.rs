//! Fan-in: combine many receivers of the same event type into one.

use tokio::sync::mpsc;

/// Merge `inputs` into a single receiver.
///
/// Every event sent on any input is delivered exactly once on the output.
/// Order is preserved per input only. The output closes once every input
/// has closed: each forwarding task owns a clone of the output sender, so
/// the channel closes when the last of them finishes.
///
/// The output buffer holds at least one event per input, so a burst where
/// every input produces at once never blocks a forwarder.
pub fn merge<T>(inputs: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(inputs.len().max(1));

    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = input.recv().await {
                if tx.send(event).await.is_err() {
                    // Nobody is listening any more.
                    break;
                }
            }
        });
    }

    rx
}
