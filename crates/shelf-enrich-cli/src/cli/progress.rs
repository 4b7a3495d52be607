//! Terminal progress bar driven by the job's progress events.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use shelf_enrich::progress::{ProgressEventKind, ProgressReceiver};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const TEMPLATE: &str = "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Render events until the channel closes.
pub fn spawn(mut rx: ProgressReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );

        loop {
            match rx.recv().await {
                Ok(event) => match event.event {
                    ProgressEventKind::JobStarted { total, .. } => {
                        bar.set_length(total as u64);
                        bar.set_message(counter_message(0, 0));
                    }
                    ProgressEventKind::EntityMerged { done, failed, .. } => {
                        bar.set_position((done + failed) as u64);
                        bar.set_message(counter_message(done, failed));
                    }
                    ProgressEventKind::JobComplete { done, failed, .. } => {
                        bar.finish_with_message(counter_message(done, failed));
                    }
                    ProgressEventKind::Warning { message } => {
                        bar.println(format!("warning: {message}"));
                    }
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }

        if !bar.is_finished() {
            bar.abandon();
        }
    })
}

fn counter_message(done: usize, failed: usize) -> String {
    format!("done {done}, failed {failed}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_enrich::progress::{self, ProgressEvent};

    #[test]
    fn test_counter_message() {
        assert_eq!(counter_message(3, 1), "done 3, failed 1");
    }

    #[tokio::test]
    async fn test_renderer_stops_when_channel_closes() {
        let (tx, rx) = progress::channel();
        let handle = spawn(rx);
        tx.send(ProgressEvent {
            job_id: "job".into(),
            seq: 1,
            event: ProgressEventKind::JobStarted {
                total: 1,
                pool_width: 1,
            },
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
