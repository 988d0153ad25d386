use crate::comm::Comm;
use crate::env::CommConfig;
use crate::mesh;
use crate::router::RoutingMode;

pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn init_logger() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Small buffers so tests exercise flushing and backpressure without
/// megabytes of traffic.
pub fn small_config(routing: RoutingMode) -> CommConfig {
    CommConfig {
        buffer_capacity: 256,
        total_send_budget: 4096,
        irecv_count: 8,
        irecv_size: 4096,
        routing,
        welcome: false,
    }
}

/// Runs `f` as every peer of an in-memory job, one thread per peer, and
/// joins them. Peer panics and errors propagate to the caller.
pub fn cluster<F>(nodes: usize, width: usize, config: CommConfig, f: F)
where
    F: Fn(&Comm) -> Result + Send + Sync,
{
    init_logger();
    std::thread::scope(|scope| {
        let handles: Vec<_> = mesh::with_nodes(nodes, width)
            .into_iter()
            .map(|endpoint| {
                let config = config.clone();
                let f = &f;
                scope.spawn(move || {
                    let comm = Comm::with_config(endpoint, config).unwrap();
                    f(&comm).unwrap();
                })
            })
            .collect();
        for handle in handles {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    });
}
