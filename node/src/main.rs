mod spec;
mod trainer;

use std::{env, io, sync::Arc, time::Duration};

use comms::TcpTransport;
use log::{debug, info};
use weight_sync::SynchronizationAgent;

use crate::{spec::NodeSpec, trainer::Trainer};

const SPEC_VAR: &str = "NODE_SPEC";
const LOG_EVERY: usize = 100;

fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var(SPEC_VAR).ok())
        .ok_or_else(|| io::Error::other(format!("usage: node <spec.json>, or set {SPEC_VAR}")))?;

    let spec = NodeSpec::load(&path)?;
    info!(rank = spec.rank, world_size = spec.peers.len(); "loaded spec from {path}");

    let transport = TcpTransport::connect(spec.rank, &spec.peers)?;
    let rank = spec.rank;

    let agent = SynchronizationAgent::builder(Arc::new(transport))
        .poll_interval(Duration::from_millis(spec.poll_interval_ms))
        .bind_context(move || debug!(rank = rank; "communication thread bound"))
        .build();

    let mut trainer = Trainer::new(&agent, &spec)?;
    agent.start()?;

    for step in 1..=spec.steps {
        let loss = trainer.step()?;

        if step % LOG_EVERY == 0 || step == spec.steps {
            info!(step = step, loss = loss; "training");
        }
    }

    agent.pause();
    let snapshot = trainer.checkpoint()?;
    agent.resume();

    let norm: f32 = snapshot.iter().flatten().map(|w| w * w).sum::<f32>().sqrt();
    info!(layers = snapshot.len(), norm = norm; "checkpointed weights");

    for id in trainer.channels() {
        let stats = agent.stats(id)?;
        info!(
            id = id,
            sends = stats.sends,
            receives = stats.receives,
            drains = stats.drains,
            local_only_steps = stats.local_only_steps;
            "channel summary"
        );
    }

    agent.shutdown();
    info!("wrapping up, disconnecting...");
    Ok(())
}
