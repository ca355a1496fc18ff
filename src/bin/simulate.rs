use std::{path::PathBuf, process, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use structopt::StructOpt;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::*;

use crowd_sync::{
    feed::StreamKind,
    memory::MemoryStore,
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    scheduler::{UnitId, WorkKind},
    settings::{EngineSettings, Settings},
    trainer::{SoftmaxTrainer, SyntheticProblem},
    Notify,
    SyncEngine,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Crowd Simulation")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
    /// Seed of the synthetic data set
    #[structopt(short, long)]
    seed: Option<u64>,
}

/// Logs what a device's engine reports.
struct DeviceLog(DeviceId);

impl Notify for DeviceLog {
    fn notify_work_started(&mut self, unit: UnitId, kind: WorkKind) {
        debug!(device = %self.0, %unit, %kind, "work started");
    }

    fn notify_session_reset(&mut self) {
        info!(device = %self.0, "new session");
    }

    fn notify_publish_failed(&mut self, record: &CoordinationRecord, reason: &str) {
        warn!(
            device = %self.0,
            grad_iter = record.gradient_iteration,
            "publication failed: {}",
            reason
        );
    }

    fn notify_feed_error(&mut self, stream: StreamKind, reason: &str) {
        warn!(device = %self.0, %stream, "feed error: {}", reason);
    }
}

/// Runs several devices against an in-memory store, with a toy server aggregating their
/// results, until the configured number of rounds is reached.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let engine_settings = settings.engine();
    let Settings {
        log: log_settings,
        simulation,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let mut rng = match opt.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let problem = SyntheticProblem::new(&mut rng, simulation.features, simulation.classes);
    let evaluator = SoftmaxTrainer::new(
        problem.samples(&mut rng, 1000),
        simulation.features,
        simulation.classes,
    );

    let store = MemoryStore::new();
    store.set_parameters(Parameters {
        learning_rate: simulation.learning_rate,
        noise_scale: simulation.noise_scale,
        batch_size: simulation.batch_size,
        ..Parameters::new(1, simulation.local_update_count)
    });
    store.set_weights(WeightSnapshot::new(0, vec![0.0; evaluator.model_len()]));

    let mut handles = Vec::with_capacity(simulation.devices);
    let mut engines = Vec::with_capacity(simulation.devices);
    for i in 0..simulation.devices {
        let device = DeviceId::new(format!("{}-{}", engine_settings.device, i));
        store.register(device.clone());

        let trainer = SoftmaxTrainer::new(
            problem.samples(&mut rng, simulation.samples_per_device),
            simulation.features,
            simulation.classes,
        );
        let (engine, handle) = SyncEngine::new(
            EngineSettings {
                device: device.clone(),
                reconnect: engine_settings.reconnect,
            },
            store.clone(),
            store.clone(),
            trainer,
            DeviceLog(device),
        );
        engines.push(tokio::spawn(engine.run()));
        handle.start()?;
        handles.push(handle);
    }
    info!(devices = simulation.devices, "simulation started");

    let mut ticker = tokio::time::interval(Duration::from_millis(simulation.tick_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let aggregation = store.aggregate_pending(simulation.learning_rate);
                if aggregation.applied > 0 {
                    if let Some(weights) = store.weights() {
                        info!(
                            round = weights.iteration,
                            results = aggregation.applied,
                            loss = evaluator.loss(&weights.weights),
                            accuracy = evaluator.accuracy(&weights.weights),
                            "global model updated"
                        );
                    }
                }
                if aggregation.iteration >= simulation.rounds {
                    info!(rounds = aggregation.iteration, "simulation finished");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    for handle in &handles {
        let status = handle.status().await?;
        info!(
            grad_iter = status.gradient_iteration,
            phase = %status.phase,
            "device status"
        );
        handle.shutdown().await?;
    }
    for engine in engines {
        engine.await?;
    }
    Ok(())
}
