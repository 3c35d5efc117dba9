use std::sync::Arc;
use std::time::Duration;

use vannot_models::{JobStatus, PipelineEvent};
use vannot_pipeline::{
    BufferPool, FrameShape, PipelineController, PipelineConfig, ScriptedModel, SyntheticVideo,
};
use vannot_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();

    println!(
        "pipeline-selfcheck: starting with batch_size={} workers={}",
        config.pipeline.batch_size,
        config.pipeline.worker_count()
    );
    config.validate()?;
    ensure_pool_accounting(config.frame_shape())?;
    ensure_ordered_run(config.frame_shape(), config.pipeline.clone()).await?;
    ensure_degradation(config.frame_shape(), config.pipeline.clone()).await?;

    println!("pipeline-selfcheck: ok");
    Ok(())
}

fn ensure_pool_accounting(shape: FrameShape) -> anyhow::Result<()> {
    let pool = BufferPool::new(shape, 2, 1.0);
    let first = pool.acquire()?;
    let second = pool.acquire()?;
    if pool.acquire().is_ok() {
        return Err(anyhow::anyhow!("pool allocated beyond its ceiling"));
    }
    drop(first);
    drop(second);

    let stats = pool.stats();
    if stats.in_use != 0 || stats.free != 2 {
        return Err(anyhow::anyhow!("pool leaked buffers: {:?}", stats));
    }
    Ok(())
}

async fn ensure_ordered_run(shape: FrameShape, config: PipelineConfig) -> anyhow::Result<()> {
    let frames = (config.batch_size * 4) as u64;
    let model = Arc::new(ScriptedModel::new().with_delay(Duration::from_millis(1)));
    let controller = PipelineController::new(model);

    let mut handle = controller
        .start(Box::new(SyntheticVideo::new(frames, shape)), config)
        .await?;
    let mut events = handle
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event stream unavailable"))?;

    let mut expected = 0u64;
    while let Some(event) = events.recv().await {
        if let PipelineEvent::Detections(frame) = event {
            if frame.sequence_number != expected {
                return Err(anyhow::anyhow!(
                    "expected frame {}, got {}",
                    expected,
                    frame.sequence_number
                ));
            }
            expected += 1;
        }
    }

    let job = handle.wait().await;
    if job.status != JobStatus::Completed || job.frames_processed != frames {
        return Err(anyhow::anyhow!(
            "job ended {} after {} of {} frames",
            job.status,
            job.frames_processed,
            frames
        ));
    }
    if handle.pool_stats().in_use != 0 {
        return Err(anyhow::anyhow!("buffers still in use after job"));
    }
    Ok(())
}

async fn ensure_degradation(shape: FrameShape, config: PipelineConfig) -> anyhow::Result<()> {
    let frames = config.batch_size as u64;
    let model = Arc::new(ScriptedModel::new().exhausted_above(1));
    let controller = PipelineController::new(model.clone());

    let mut handle = controller
        .start(Box::new(SyntheticVideo::new(frames, shape)), config)
        .await?;
    let job = tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .map_err(|_| anyhow::anyhow!("degraded run did not finish"))?;

    if job.status != JobStatus::Completed || model.frames_seen() != frames {
        return Err(anyhow::anyhow!(
            "degraded run processed {} of {} frames",
            model.frames_seen(),
            frames
        ));
    }
    if frames > 1 && model.calls() <= frames {
        return Err(anyhow::anyhow!("model was never retried at a smaller size"));
    }
    Ok(())
}
