use tracing::{debug, info};
use weft::{
    AffinityPolicy, Cluster, Config, Dependency, Error, GlobalId, Registry, PARAM_DEF,
};

fn read_u64(dep: &Dependency) -> u64 {
    dep.buffer
        .as_ref()
        .map(|buffer| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buffer.read()[..8]);
            u64::from_le_bytes(word)
        })
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let nodes: u32 = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(4);

    let mut registry = Registry::new();
    // each square lands in a block of its own, handed on as the task result
    registry.register("square", |scope, params, _| {
        let (block, buffer) = scope.db_create(8, 0, GlobalId::NULL)?;
        let buffer = buffer.ok_or(Error::LockNotHeld(block))?;
        buffer.write()[..8].copy_from_slice(&(params[0] * params[0]).to_le_bytes());
        debug!(node = scope.node(), n = params[0], "squared");
        Ok(block)
    });
    registry.register("sum", |scope, _, deps| {
        let total: u64 = deps.iter().map(read_u64).sum();
        info!(total, terms = deps.len(), "sum of squares");
        scope.shutdown()?;
        Ok(GlobalId::NULL)
    });

    let config = Config::builder()
        .nodes(nodes)
        .affinity(AffinityPolicy::RoundRobin)
        .build();
    let cluster = Cluster::start(config, registry)?;
    cluster
        .run(move |scope| {
            let square = scope.template_create("square", 1, 0)?;
            let sum = scope.template_create("sum", 0, PARAM_DEF)?;
            let mut squares = Vec::new();
            for n in 1..=u64::from(nodes) * 2 {
                let (_, done) = scope.task_create(square, &[n], 0, None, 0, GlobalId::NULL)?;
                squares.push(done);
            }
            scope.task_create(sum, &[], squares.len() as u32, Some(&squares), 0, GlobalId::node_hint(0))?;
            Ok(())
        })
        .await?;

    for node in 0..nodes {
        for (command, count, bytes) in cluster.stats(node)?.snapshot() {
            debug!(node, ?command, count, bytes, "sent");
        }
    }
    cluster.stop().await
}
