use std::time::{Duration, Instant};

use ulid::Ulid;

use resalloc::engine::{check_allocation, detect_conflicts};
use resalloc::model::{Allocation, Scope, Span, MS_PER_HOUR};

const RESOURCES: usize = 50;
const PER_RESOURCE: usize = 200;
const ROUNDS: usize = 200;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// Hour-long slots, back to back, with every tenth one stretched into its
/// neighbour so the scan has something to report.
fn synthetic(resources: &[Ulid]) -> Vec<Allocation> {
    let mut out = Vec::with_capacity(resources.len() * PER_RESOURCE);
    let mut seq = 0;
    for &resource_id in resources {
        for i in 0..PER_RESOURCE as i64 {
            let start = i * MS_PER_HOUR;
            let end = if i % 10 == 0 { start + MS_PER_HOUR + MS_PER_HOUR / 2 } else { start + MS_PER_HOUR };
            seq += 1;
            out.push(Allocation {
                id: Ulid::new(),
                event_id: Ulid::new(),
                resource_id,
                span: Span::new(start, end).unwrap(),
                custom_span: false,
                seq,
            });
        }
    }
    out.sort_by_key(|a| a.id);
    out
}

fn main() {
    let resources: Vec<Ulid> = (0..RESOURCES).map(|_| Ulid::new()).collect();
    let allocations = synthetic(&resources);
    println!(
        "detect bench: {} resources x {} allocations",
        RESOURCES, PER_RESOURCE
    );

    let mut scan_all = Vec::with_capacity(ROUNDS);
    let mut found = 0;
    for _ in 0..ROUNDS {
        let t = Instant::now();
        found = detect_conflicts(&allocations, Scope::AllResources).len();
        scan_all.push(t.elapsed());
    }
    println!("  {found} conflicting pairs");
    print_latency("detect_conflicts (all resources)", &mut scan_all);

    let mut scan_one = Vec::with_capacity(ROUNDS);
    for round in 0..ROUNDS {
        let rid = resources[round % RESOURCES];
        let t = Instant::now();
        let _ = detect_conflicts(&allocations, Scope::SingleResource(rid));
        scan_one.push(t.elapsed());
    }
    print_latency("detect_conflicts (one resource)", &mut scan_one);

    let mut checks = Vec::with_capacity(ROUNDS);
    let mut accepted = 0;
    for round in 0..ROUNDS {
        let rid = resources[round % RESOURCES];
        // Past the last slot: free. Inside the range: blocked.
        let start = if round % 2 == 0 { (PER_RESOURCE as i64 + 1) * MS_PER_HOUR } else { 5 * MS_PER_HOUR };
        let span = Span::new(start, start + MS_PER_HOUR).unwrap();
        let t = Instant::now();
        if check_allocation(&allocations, rid, Ulid::new(), &span, None).is_ok() {
            accepted += 1;
        }
        checks.push(t.elapsed());
    }
    println!("  {accepted}/{ROUNDS} proposals accepted");
    print_latency("check_allocation", &mut checks);
}
