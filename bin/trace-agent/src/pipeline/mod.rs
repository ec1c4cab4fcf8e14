//! Pipeline wiring.
//!
//! Every stage runs as its own supervised task, connected to its neighbours by bounded channels:
//!
//! ```text
//! receiver -> normalizer -+-> concentrator ----------> stats writer
//!                         +-> sampler ---------------> trace writer
//!                         +-> service mapper --------> service writer
//! receiver (services) ----^
//! ```
//!
//! Stages own their state behind a mutex so that a restart after a panic resumes with the same samplers, buckets and
//! buffers. Shutdown is driven by channel closure: once the receiver stops, each stage drains its input and exits,
//! which closes the input of the next one.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use basenji_common::task::spawn_supervised;
use basenji_components::{
    concentrator::Concentrator,
    presampler::PreSampler,
    sampler::{RateByService, TraceSampler},
    services::ServiceMapper,
    writer::{PayloadWriter, ServiceWriter, StatsWriter, TraceWriter},
};
use basenji_core::{ProcessedTrace, ServicesMetadata, StatsBucket, Trace};
use basenji_error::{ErrorContext as _, GenericError};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfiguration;

mod normalize;
use self::normalize::NormalizerStage;

/// A trace handed over by the receiver.
#[derive(Debug)]
pub struct IncomingTrace {
    pub trace: Trace,

    /// Pre-sampler rate in effect when the payload was admitted.
    pub presampler_rate: f64,
}

/// Intake side of a running pipeline.
#[derive(Clone)]
pub struct PipelineInputs {
    pub traces: mpsc::Sender<IncomingTrace>,
    pub services: mpsc::Sender<ServicesMetadata>,
    pub presampler: Arc<PreSampler>,
    pub rate_by_service: RateByService,
}

#[async_trait]
trait Stage: Send + 'static {
    async fn run(&mut self, shutdown: &CancellationToken);
}

/// A component reading from one channel and, optionally, writing to another.
struct Worker<C, I, O> {
    component: C,
    input: mpsc::Receiver<I>,
    output: O,
}

#[async_trait]
impl Stage for Worker<Concentrator, Arc<ProcessedTrace>, mpsc::Sender<Vec<StatsBucket>>> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, &self.output, shutdown).await
    }
}

#[async_trait]
impl Stage for Worker<TraceSampler, Arc<ProcessedTrace>, mpsc::Sender<Trace>> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, &self.output, shutdown).await
    }
}

#[async_trait]
impl Stage for Worker<ServiceMapper, ServicesMetadata, mpsc::Sender<ServicesMetadata>> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, &self.output, shutdown).await
    }
}

#[async_trait]
impl Stage for Worker<TraceWriter, Trace, ()> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, shutdown).await
    }
}

#[async_trait]
impl Stage for Worker<StatsWriter, Vec<StatsBucket>, ()> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, shutdown).await
    }
}

#[async_trait]
impl Stage for Worker<ServiceWriter, ServicesMetadata, ()> {
    async fn run(&mut self, shutdown: &CancellationToken) {
        self.component.run(&mut self.input, shutdown).await
    }
}

/// Running pipeline stages, upstream first.
pub struct Pipeline {
    stages: VecDeque<(&'static str, JoinHandle<()>)>,
    abort: CancellationToken,
}

impl Pipeline {
    /// Builds every stage from `config` and spawns them, submitting payloads through `writer`.
    ///
    /// # Errors
    ///
    /// If a component configuration is invalid, an error is returned and nothing is spawned.
    pub fn spawn(
        config: &AgentConfiguration, writer: Arc<dyn PayloadWriter>,
    ) -> Result<(Self, PipelineInputs), GenericError> {
        let queue_size = config.receiver().queue_size();

        let normalizer = config
            .normalizer()
            .build()
            .error_context("Failed to build normalizer.")?;
        let concentrator = config
            .concentrator()
            .build()
            .error_context("Failed to build concentrator.")?;
        let rate_by_service = RateByService::new();
        let sampler = config
            .sampler()
            .build(rate_by_service.clone())
            .error_context("Failed to build sampler.")?;
        let presampler = Arc::new(
            config
                .presampler()
                .build()
                .error_context("Failed to build pre-sampler.")?,
        );

        let (traces_tx, traces_rx) = mpsc::channel(queue_size);
        let (concentrator_tx, concentrator_rx) = mpsc::channel(queue_size);
        let (sampler_tx, sampler_rx) = mpsc::channel(queue_size);
        let (services_tx, services_rx) = mpsc::channel(queue_size);
        let (stats_tx, stats_rx) = mpsc::channel(queue_size);
        let (sampled_tx, sampled_rx) = mpsc::channel(queue_size);
        let (mapped_tx, mapped_rx) = mpsc::channel(queue_size);

        let abort = CancellationToken::new();
        let mut pipeline = Self {
            stages: VecDeque::new(),
            abort,
        };

        pipeline.spawn_stage(
            "normalizer",
            NormalizerStage::new(normalizer, traces_rx, concentrator_tx, sampler_tx, services_tx.clone()),
        );
        pipeline.spawn_stage(
            "concentrator",
            Worker {
                component: concentrator,
                input: concentrator_rx,
                output: stats_tx,
            },
        );
        pipeline.spawn_stage(
            "sampler",
            Worker {
                component: sampler,
                input: sampler_rx,
                output: sampled_tx,
            },
        );
        pipeline.spawn_stage(
            "service_mapper",
            Worker {
                component: ServiceMapper::new(),
                input: services_rx,
                output: mapped_tx,
            },
        );

        let writer_config = config.writer();
        pipeline.spawn_stage(
            "stats_writer",
            Worker {
                component: StatsWriter::new(Arc::clone(&writer), writer_config),
                input: stats_rx,
                output: (),
            },
        );
        pipeline.spawn_stage(
            "trace_writer",
            Worker {
                component: TraceWriter::new(Arc::clone(&writer), writer_config),
                input: sampled_rx,
                output: (),
            },
        );
        pipeline.spawn_stage(
            "service_writer",
            Worker {
                component: ServiceWriter::new(writer, writer_config),
                input: mapped_rx,
                output: (),
            },
        );

        let inputs = PipelineInputs {
            traces: traces_tx,
            services: services_tx,
            presampler,
            rate_by_service,
        };
        Ok((pipeline, inputs))
    }

    fn spawn_stage<S: Stage>(&mut self, name: &'static str, stage: S) {
        let stage = Arc::new(Mutex::new(stage));
        let shutdown = self.abort.clone();
        let handle = spawn_supervised(name, move || {
            let stage = Arc::clone(&stage);
            let shutdown = shutdown.clone();
            async move { stage.lock().await.run(&shutdown).await }
        });
        self.stages.push_back((name, handle));
    }

    /// Waits for every stage to drain and exit.
    ///
    /// The pipeline inputs must have been dropped beforehand. Stages still running after `grace` are stopped without
    /// draining.
    pub async fn stop(mut self, grace: Duration) {
        if timeout(grace, join_stages(&mut self.stages)).await.is_err() {
            warn!(
                remaining = self.stages.len(),
                "Pipeline did not drain within {:?}. Stopping remaining stages.", grace
            );
            self.abort.cancel();
            join_stages(&mut self.stages).await;
        }
        info!("Pipeline stopped.");
    }
}

async fn join_stages(stages: &mut VecDeque<(&'static str, JoinHandle<()>)>) {
    while let Some((name, handle)) = stages.front_mut() {
        let result = handle.await;
        let name = *name;
        stages.pop_front();
        if let Err(e) = result {
            error!(stage = name, error = %e, "Pipeline stage failed.");
        }
    }
}
