use crate::batch::CompositeBatch;
use crate::config::CoordinatorConfig;
use crate::item::Item;
use crate::runtime::{BatchCoordinatorBuilder, BatchSink, DeliveryError};
use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_CHANNELS: u32 = 3;
const DEMO_FRAMES: u64 = 90;

/// Counts delivered batches and logs a summary line every second of output.
struct SummarySink {
    delivered: Arc<AtomicU64>,
}

impl BatchSink for SummarySink {
    fn deliver(&mut self, batch: CompositeBatch) -> Result<(), DeliveryError> {
        let total = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 30 == 0 {
            info!(
                sequence = batch.sequence(),
                mask = batch.mask().bits(),
                items = batch.item_count(),
                bytes = batch.size(),
                "delivered batches: {total}"
            );
        }
        Ok(())
    }

    fn end_of_stream(&mut self) {
        info!("end of stream reached downstream");
    }
}

/// Application entrypoint. Loads the coordinator configuration (first
/// argument, JSON) and runs a synthetic multi-producer session against it.
pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match env::args().nth(1) {
        Some(path) => CoordinatorConfig::load(&path)
            .with_context(|| format!("loading coordinator config from {path}"))?,
        None => CoordinatorConfig::default(),
    };
    info!(
        depth = config.depth(),
        moving_window_size = config.moving_window_size(),
        duration_us = config.duration().as_micros() as u64,
        "coordinator configuration"
    );

    let delivered = Arc::new(AtomicU64::new(0));
    let coordinator = Arc::new(
        BatchCoordinatorBuilder::new("syncbatch")
            .config(config)
            .sink(SummarySink {
                delivered: delivered.clone(),
            })
            .build(),
    );
    let handles = (0..DEMO_CHANNELS)
        .map(|_| coordinator.create_channel())
        .collect::<Result<Vec<_>, _>>()?;
    coordinator.start()?;

    let frame = config.duration() / config.depth() as u32;
    let producers = handles
        .iter()
        .map(|&handle| -> Result<thread::JoinHandle<Result<()>>> {
            let sender = coordinator.sender(handle)?;
            let coordinator = coordinator.clone();
            let producer = thread::Builder::new()
                .name(format!("producer_{}", handle.index()))
                .spawn(move || -> Result<()> {
                    for n in 0..DEMO_FRAMES {
                        let item = Item::new(n.to_le_bytes().to_vec())
                            .with_timestamp(frame * n as u32)
                            .with_duration(frame);
                        sender.push(item)?;
                        thread::sleep(frame);
                    }
                    coordinator.mark_eos(handle)?;
                    Ok(())
                })?;
            Ok(producer)
        })
        .collect::<Result<Vec<_>>>()?;

    for producer in producers {
        producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    }
    coordinator.wait_egress_idle(Duration::from_secs(5));
    coordinator.stop()?;

    info!(delivered = delivered.load(Ordering::Relaxed), "session finished");
    print!("{}", coordinator.render_metrics());
    Ok(())
}
