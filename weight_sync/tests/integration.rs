use std::{
    net::{SocketAddr, TcpListener},
    num::NonZeroUsize,
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use comms::{LocalTransport, TcpTransport, Transport};
use ndarray::{Array2, array};
use weight_sync::{
    GroupId, ParameterHandle, PolicySpec, SyncErr, SynchronizationAgent, policy::MomentumPolicy,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_agent(transport: Arc<dyn Transport>) -> Arc<SynchronizationAgent> {
    SynchronizationAgent::builder(transport)
        .on_fatal(|e| panic!("unexpected fatal error: {e}"))
        .build()
}

fn unit_momentum() -> PolicySpec {
    PolicySpec::Momentum {
        learning_rate: 1.0,
        momentum: 0.0,
        decay: 0.0,
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < TIMEOUT, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

fn tcp_mesh(size: usize) -> Vec<TcpTransport> {
    let addrs: Vec<SocketAddr> = {
        let listeners: Vec<_> = (0..size)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    };

    let nodes: Vec<_> = (0..size)
        .map(|rank| {
            let addrs = addrs.clone();
            thread::spawn(move || TcpTransport::connect(rank, &addrs).unwrap())
        })
        .collect();

    nodes.into_iter().map(|node| node.join().unwrap()).collect()
}

fn step(
    agent: &SynchronizationAgent,
    id: GroupId,
    grads: &Array2<f32>,
    momentum: &mut Array2<f32>,
    weights: &mut Array2<f32>,
    batch: usize,
) {
    agent
        .send_and_recv(
            id,
            grads.view(),
            momentum.view_mut(),
            weights.view_mut(),
            NonZeroUsize::new(batch).unwrap(),
        )
        .unwrap();
}

#[test]
fn momentum_converges_without_remote_data() {
    init_logger();
    let agent = quiet_agent(Arc::new(LocalTransport::mesh(1).remove(0)));
    agent.start().unwrap();

    let grads = [array![[1.0, -2.0], [0.5, 4.0]], array![[8.0, 0.0, -1.0]]];
    let mut state: Vec<_> = grads
        .iter()
        .map(|g| {
            let id = agent.register_channel(Box::new(MomentumPolicy::new(0.1, 0.9, 0.0)));
            (id, Array2::zeros(g.raw_dim()), Array2::zeros(g.raw_dim()))
        })
        .collect();

    for _ in 0..200 {
        for ((id, momentum, weights), g) in state.iter_mut().zip(&grads) {
            step(&agent, *id, g, momentum, weights, 4);
        }
    }

    for ((id, momentum, _), g) in state.iter().zip(&grads) {
        let rate: f32 = 0.1 / ((1.0 - 0.9) * 4.0);
        let expected = g * rate;
        let converged = momentum
            .iter()
            .zip(expected.iter())
            .all(|(m, e)| (m - e).abs() < 1e-4);
        assert!(converged, "{momentum} != {expected}");

        let stats = agent.stats(*id).unwrap();
        assert_eq!(stats.receives, 0);
        assert_eq!(stats.local_only_steps, 200);
    }

    agent.shutdown();
}

#[test]
fn short_remote_delta_is_fatal() {
    init_logger();
    let mut mesh = LocalTransport::mesh(2);
    let peer = mesh.pop().unwrap();
    let (tx, rx) = mpsc::channel();

    let agent = SynchronizationAgent::builder(Arc::new(mesh.pop().unwrap()))
        .on_fatal(move |e| {
            if let SyncErr::ProtocolDesync { id, expected, got } = e {
                let _ = tx.send((*id, *expected, *got));
            }
        })
        .build();

    let id = agent.register_channel(unit_momentum().build());
    let grads = Array2::zeros((2, 5));
    let mut momentum = Array2::zeros((2, 5));
    let mut weights = Array2::ones((2, 5));
    step(&agent, id, &grads, &mut momentum, &mut weights, 1);

    peer.isend(0, id, &[1.0; 9]).unwrap();
    agent.start().unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (id, 10, 9));

    step(&agent, id, &grads, &mut momentum, &mut weights, 1);
    assert_eq!(weights, Array2::<f32>::ones((2, 5)));

    let stats = agent.stats(id).unwrap();
    assert_eq!(stats.receives, 0);
    assert_eq!(stats.drains, 0);
}

#[test]
fn remote_delta_is_merged_into_the_next_step() {
    init_logger();
    let mut mesh = LocalTransport::mesh(2);
    let second = quiet_agent(Arc::new(mesh.pop().unwrap()));
    let first = quiet_agent(Arc::new(mesh.pop().unwrap()));

    let a = first.register_channel(unit_momentum().build());
    let b = second.register_channel(unit_momentum().build());
    assert_eq!(a, b);

    first.start().unwrap();
    second.start().unwrap();

    let zeros = Array2::zeros((1, 2));
    let (mut momentum, mut weights) = (Array2::zeros((1, 2)), Array2::zeros((1, 2)));
    step(&first, a, &zeros, &mut momentum, &mut weights, 1);

    let (mut remote_momentum, mut remote_weights) = (Array2::zeros((1, 2)), Array2::zeros((1, 2)));
    step(&second, b, &array![[1.0, 2.0]], &mut remote_momentum, &mut remote_weights, 1);
    assert_eq!(remote_weights, array![[1.0, 2.0]]);

    wait_until(|| first.stats(a).unwrap().receives >= 1);
    step(&first, a, &zeros, &mut momentum, &mut weights, 1);
    assert_eq!(weights, array![[1.0, 2.0]]);

    let stats = first.stats(a).unwrap();
    assert_eq!(stats.drains, 1);
    assert_eq!(stats.local_only_steps, 1);

    first.shutdown();
    second.shutdown();
}

#[test]
fn checkpoint_while_paused() {
    init_logger();
    let agent = quiet_agent(Arc::new(LocalTransport::mesh(1).remove(0)));
    let spec = PolicySpec::Momentum {
        learning_rate: 0.5,
        momentum: 0.0,
        decay: 0.0,
    };

    let conv = ParameterHandle::new(&agent, Array2::zeros((2, 2)), spec);
    let shared = conv.mirror();
    agent.start().unwrap();

    conv.copy_to_device().unwrap();
    shared.with_grads(|mut g| g.fill(2.0)).unwrap();
    conv.increment_update_count().unwrap();
    shared.increment_update_count().unwrap();
    assert_eq!(shared.update_count().unwrap(), 2);

    conv.update(NonZeroUsize::MIN).unwrap();
    shared.update(NonZeroUsize::MIN).unwrap();

    agent.pause();
    assert!(agent.is_paused());
    conv.copy_to_host().unwrap();
    agent.resume();

    assert_eq!(conv.host_weights().unwrap(), Array2::from_elem((2, 2), 1.0));
    assert_eq!(shared.host_weights().unwrap(), conv.host_weights().unwrap());
    assert_eq!(shared.update_count().unwrap(), 0);

    agent.shutdown();
}

#[test]
fn concurrent_deltas_are_conserved() {
    const STEPS: usize = 2000;

    init_logger();
    let mut mesh = LocalTransport::mesh(2);
    let second = quiet_agent(Arc::new(mesh.pop().unwrap()));
    let first = quiet_agent(Arc::new(mesh.pop().unwrap()));

    let id = first.register_channel(unit_momentum().build());
    second.register_channel(unit_momentum().build());
    first.start().unwrap();
    second.start().unwrap();

    let expected = Array2::from_elem((1, 4), STEPS as f32);

    let producer = {
        let second = Arc::clone(&second);
        thread::spawn(move || {
            let ones = Array2::ones((1, 4));
            let (mut momentum, mut weights) = (Array2::zeros((1, 4)), Array2::zeros((1, 4)));
            for _ in 0..STEPS {
                step(&second, id, &ones, &mut momentum, &mut weights, 1);
            }
            weights
        })
    };

    let zeros = Array2::zeros((1, 4));
    let (mut momentum, mut weights) = (Array2::zeros((1, 4)), Array2::zeros((1, 4)));
    let start = Instant::now();

    while weights != expected {
        assert!(start.elapsed() < TIMEOUT, "stuck at {weights}");
        step(&first, id, &zeros, &mut momentum, &mut weights, 1);
        thread::sleep(Duration::from_micros(50));
    }

    assert_eq!(producer.join().unwrap(), expected);

    for _ in 0..20 {
        step(&first, id, &zeros, &mut momentum, &mut weights, 1);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(weights, expected);

    first.shutdown();
    second.shutdown();
}

#[test]
fn survivor_outlives_a_departed_peer() {
    init_logger();
    let mut mesh = tcp_mesh(2);
    let (tx, rx) = mpsc::channel();

    let second = quiet_agent(Arc::new(mesh.pop().unwrap()));
    let first = SynchronizationAgent::builder(Arc::new(mesh.pop().unwrap()))
        .on_fatal(move |e| {
            let _ = tx.send(e.to_string());
        })
        .build();

    let id = first.register_channel(unit_momentum().build());
    second.register_channel(unit_momentum().build());
    first.start().unwrap();
    second.start().unwrap();

    let ones = Array2::ones((1, 2));
    let (mut momentum, mut weights) = (Array2::zeros((1, 2)), Array2::zeros((1, 2)));
    step(&first, id, &ones, &mut momentum, &mut weights, 1);

    let (mut remote_momentum, mut remote_weights) = (Array2::zeros((1, 2)), Array2::zeros((1, 2)));
    let twos = Array2::from_elem((1, 2), 2.0);
    step(&second, id, &twos, &mut remote_momentum, &mut remote_weights, 1);

    wait_until(|| first.stats(id).unwrap().receives >= 1);
    drop(second);

    for _ in 0..50 {
        step(&first, id, &ones, &mut momentum, &mut weights, 1);
        thread::sleep(Duration::from_millis(2));
    }

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(weights, Array2::from_elem((1, 2), 53.0));

    first.shutdown();
}

#[test]
fn tcp_mesh_exchanges_deltas() {
    init_logger();
    let agents: Vec<_> = tcp_mesh(2)
        .into_iter()
        .map(|node| quiet_agent(Arc::new(node)))
        .collect();

    for agent in &agents {
        agent.register_channel(unit_momentum().build());
        agent.start().unwrap();
    }

    let mut weights: Vec<Array2<f32>> = vec![Array2::zeros((3, 1)); 2];
    let mut momentum: Vec<Array2<f32>> = vec![Array2::zeros((3, 1)); 2];
    let grads = [array![[1.0], [0.0], [0.0]], array![[0.0], [0.0], [3.0]]];

    for (rank, agent) in agents.iter().enumerate() {
        step(agent, 0, &grads[rank], &mut momentum[rank], &mut weights[rank], 1);
    }

    for agent in &agents {
        wait_until(|| agent.stats(0).unwrap().receives >= 1);
    }

    let zeros = Array2::zeros((3, 1));
    for (rank, agent) in agents.iter().enumerate() {
        step(agent, 0, &zeros, &mut momentum[rank], &mut weights[rank], 1);
        assert_eq!(weights[rank], array![[1.0], [0.0], [3.0]]);
    }

    for agent in &agents {
        agent.shutdown();
    }
}
