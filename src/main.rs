use loom::observer::{SubstrateAdapter, TopologyAdapter};
use loom::prelude::*;

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }

    let export = args.len() >= 2 && args[1] == "export";
    if args.len() >= 2 && !export {
        eprintln!("Unknown command: {}", args[1]);
        print_help();
        std::process::exit(2);
    }

    if let Err(e) = run(export) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("loom demo");
    println!();
    println!("USAGE:");
    println!("  loom           run the demo and print diagnostics");
    println!("  loom export    run the demo, then print the topology as JSON");
}

// Minimal demo:
// - two groups of nodes are driven in alternating blocks
// - members of a group fire together, so Hebbian updates wire them up
// - idle edges decay and prune; curiosity sprouts weak exploratory links
// - a stressed context cuts propagation short
fn run(export: bool) -> Result<()> {
    let cfg = SubstrateConfig::with_capacity(512)
        .with_seed(42)
        .with_schedule(ScheduleConfig {
            growth_every: 50,
            spawn_per_growth: 2,
            ..Default::default()
        });
    let mut substrate = Substrate::new(cfg)?;

    let mut food = Vec::new();
    let mut threat = Vec::new();
    {
        let topo = substrate.topology_mut();
        for i in 0..24 {
            let mut embedding = [0.0f32; 64];
            embedding[i % 8] = 1.0;
            let id = topo.weave(Some(&embedding))?;
            if i < 12 {
                food.push(id);
            } else {
                threat.push(id);
            }
        }
        topo.create_hyperedge(&food[..4], "food_core")?;
    }

    let feed = substrate.feed();
    for t in 0u32..600 {
        let group = if (t / 100) % 2 == 0 { &food } else { &threat };
        let now = f64::from(t) * 0.1;

        // Partial perception now and then.
        let strength = if t % 37 == 0 { 0.35 } else { 1.0 };
        for &id in group.iter().take(5) {
            feed.record_at(id, strength, now);
        }

        if t == 300 {
            substrate
                .topology_mut()
                .modulate(Hormone::ConsolidationPressure, 0.8);
        }
        if t == 320 {
            substrate
                .topology_mut()
                .modulate(Hormone::ConsolidationPressure, 0.0);
        }

        let report = substrate.tick_at(now);
        if t % 100 == 99 {
            let snap = SubstrateAdapter::new(&substrate).snapshot();
            println!(
                "t={:>4} nodes={} live={} edges={} phase={:?} sprouted={} pruned={}",
                t + 1,
                snap.topology.node_count,
                snap.topology.live_count,
                snap.topology.edge_count,
                snap.phase,
                report.hebbian.sprouted,
                report.pruned.len(),
            );
        }
    }

    let topo = substrate.topology_mut();
    let calm = topo.propagate(&food[..2], 4);
    topo.modulate(Hormone::Stress, 0.9);
    let stressed = topo.propagate(&food[..2], 4);
    println!(
        "propagation: calm steps={} active={} | stressed steps={} halted={}",
        calm.steps_run,
        calm.activated.len(),
        stressed.steps_run,
        stressed.halted_by_stress,
    );

    let probe = {
        let mut q = [0.0f32; 64];
        q[0] = 1.0;
        q
    };
    println!("most similar to axis 0: {:?}", topo.most_similar(&probe, 3));

    if export {
        match TopologyAdapter::new(topo).export().to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("export failed: {e}"),
        }
    }
    Ok(())
}
