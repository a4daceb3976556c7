/*!
 * Depository
 * The persistence worker at the end of the out queue
 *
 * Blocks on the out queue and on the output strategy alike; a strategy
 * waiting for a socket peer stalls the depository, which eventually stalls
 * the refinery and the producers. That is the pipeline's flow control.
 */

use crate::events::Event;
use crate::monitoring::PipelineMetrics;
use crate::output::OutputStrategy;
use crate::store::queue::BatchReceiver;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Depository {
    out: BatchReceiver<Event>,
    strategy: Box<dyn OutputStrategy>,
    metrics: Arc<PipelineMetrics>,
    written: u64,
}

impl Depository {
    pub fn new(
        out: BatchReceiver<Event>,
        strategy: Box<dyn OutputStrategy>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            out,
            strategy,
            metrics,
            written: 0,
        }
    }

    /// Worker loop; returns after the final sentinel has been written
    pub fn run(mut self) {
        info!("depository started");
        while let Some(batch) = self.out.take() {
            for event in &batch {
                self.dispatch(event);
                if event.is_final() {
                    self.finish();
                    return;
                }
            }
        }

        warn!("out queue closed before the final sentinel");
        self.finish();
    }

    fn dispatch(&mut self, event: &Event) {
        match self.strategy.handle(event) {
            Ok(()) => {
                self.written += 1;
                self.metrics.add_output(1);
            }
            Err(err) => {
                warn!(%err, nanos = event.nanos, "output strategy rejected event");
                self.metrics.problem();
            }
        }
    }

    fn finish(&mut self) {
        if let Err(err) = self.strategy.flush() {
            warn!(%err, "output flush failed");
            self.metrics.problem();
        }
        if let Err(err) = self.strategy.close() {
            warn!(%err, "output close failed");
            self.metrics.problem();
        }
        info!("depository flushed ({} event(s) output)", self.written);
    }
}
