//! Batch assembler stage.

use tokio::sync::mpsc;

use crate::control::StageControl;
use crate::logging::JobLogger;
use crate::source::FrameTask;

/// Contiguous, non-empty run of frame tasks ordered by sequence number.
#[derive(Debug)]
pub struct Batch {
    tasks: Vec<FrameTask>,
}

impl Batch {
    /// `None` for an empty task list.
    pub fn new(tasks: Vec<FrameTask>) -> Option<Self> {
        if tasks.is_empty() {
            None
        } else {
            Some(Self { tasks })
        }
    }

    pub fn first_sequence(&self) -> u64 {
        self.tasks[0].sequence_number
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn into_tasks(self) -> Vec<FrameTask> {
        self.tasks
    }
}

/// Groups frame tasks into batches of `batch_size`.
pub struct BatchAssembler {
    input: mpsc::Receiver<FrameTask>,
    output: mpsc::Sender<Batch>,
    batch_size: usize,
    control: StageControl,
    logger: JobLogger,
}

impl BatchAssembler {
    pub fn new(
        input: mpsc::Receiver<FrameTask>,
        output: mpsc::Sender<Batch>,
        batch_size: usize,
        control: StageControl,
        logger: JobLogger,
    ) -> Self {
        Self {
            input,
            output,
            batch_size: batch_size.max(1),
            control,
            logger,
        }
    }

    /// Run until the input closes or the job is cancelled. Returns the
    /// number of batches emitted.
    pub async fn run(mut self) -> u64 {
        let mut pending: Vec<FrameTask> = Vec::with_capacity(self.batch_size);
        let mut emitted = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.control.cancelled() => {
                    self.discard(pending);
                    return emitted;
                }
                next = self.input.recv() => next,
            };

            match next {
                Some(task) => {
                    pending.push(task);
                    if pending.len() < self.batch_size {
                        continue;
                    }
                }
                None => break,
            }

            let full = std::mem::replace(&mut pending, Vec::with_capacity(self.batch_size));
            if !self.send(full).await {
                return emitted;
            }
            emitted += 1;
        }

        // Input closed: flush the final short batch.
        if !pending.is_empty() {
            if self.send(pending).await {
                emitted += 1;
            }
        }

        self.logger
            .log_completion(&format!("{} batches assembled", emitted));
        emitted
    }

    async fn send(&mut self, tasks: Vec<FrameTask>) -> bool {
        let Some(batch) = Batch::new(tasks) else {
            return true;
        };
        tokio::select! {
            biased;
            _ = self.control.cancelled() => false,
            sent = self.output.send(batch) => sent.is_ok(),
        }
    }

    fn discard(&self, pending: Vec<FrameTask>) {
        if !pending.is_empty() {
            self.logger.log_progress(&format!(
                "Cancelled with {} frames in a partial batch",
                pending.len()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, FrameShape};
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use vannot_models::JobId;

    fn task(pool: &BufferPool, sequence_number: u64) -> FrameTask {
        FrameTask {
            sequence_number,
            source_frame_index: sequence_number,
            timestamp_seconds: sequence_number as f64 / 30.0,
            buffer: pool.acquire().unwrap(),
            malformed: None,
        }
    }

    #[tokio::test]
    async fn test_batches_with_short_tail() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 1), 32, 1.0);
        let (task_tx, task_rx) = mpsc::channel(32);
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let control = StageControl::new(CancellationToken::new(), pause_rx);

        for seq in 0..20 {
            task_tx.send(task(&pool, seq)).await.unwrap();
        }
        drop(task_tx);

        let assembler = BatchAssembler::new(
            task_rx,
            batch_tx,
            8,
            control,
            JobLogger::new(&JobId::new(), "assembler"),
        );
        assert_eq!(assembler.run().await, 3);

        let mut sizes = Vec::new();
        let mut firsts = Vec::new();
        while let Some(batch) = batch_rx.recv().await {
            sizes.push(batch.len());
            firsts.push(batch.first_sequence());
        }
        assert_eq!(sizes, vec![8, 8, 4]);
        assert_eq!(firsts, vec![0, 8, 16]);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_batch() {
        let pool = BufferPool::new(FrameShape::new(2, 2, 1), 8, 1.0);
        let (task_tx, task_rx) = mpsc::channel(8);
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let control = StageControl::new(cancel.clone(), pause_rx);

        let assembler = BatchAssembler::new(
            task_rx,
            batch_tx,
            8,
            control,
            JobLogger::new(&JobId::new(), "assembler"),
        );
        let handle = tokio::spawn(assembler.run());

        for seq in 0..3 {
            task_tx.send(task(&pool, seq)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        assert!(batch_rx.recv().await.is_none());
        drop(task_tx);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(Batch::new(Vec::new()).is_none());
    }
}
