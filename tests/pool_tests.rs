//! Tests for the prefork pool's sizing discipline at the planning
//! layer: every (idle, busy) state a supervisor tick can observe must
//! plan back toward the invariants without ever breaking them.

use arcx::pool::{PoolBounds, PoolPlan, plan};

const BOUNDS: PoolBounds = PoolBounds {
    min_servers: 2,
    max_servers: 8,
    min_spare: 2,
    max_spare: 4,
};

/// Applies a plan to a pool state, as the supervisor would.
fn apply(idle: usize, busy: usize, p: PoolPlan) -> (usize, usize) {
    (idle + p.spawn - p.retire, busy)
}

// =============================================================================
// Invariant Sweep
// =============================================================================

#[test]
fn test_plans_never_exceed_max_servers() {
    for idle in 0..=10 {
        for busy in 0..=10 {
            let p = plan(idle, busy, &BOUNDS);
            let total = idle + busy;
            assert!(
                total + p.spawn <= BOUNDS.max_servers.max(total),
                "idle={idle} busy={busy} plan={p:?}"
            );
            assert!(p.retire <= idle, "idle={idle} busy={busy} plan={p:?}");
        }
    }
}

#[test]
fn test_plans_never_drop_below_min_servers() {
    for idle in 0..=10 {
        for busy in 0..=10 {
            let p = plan(idle, busy, &BOUNDS);
            let total_after = idle + busy + p.spawn - p.retire;
            if idle + busy >= BOUNDS.min_servers {
                assert!(
                    total_after >= BOUNDS.min_servers,
                    "idle={idle} busy={busy} plan={p:?}"
                );
            }
        }
    }
}

#[test]
fn test_plans_converge_to_spare_band() {
    // From any state inside capacity, repeatedly applying plans with
    // no load changes must reach min_spare <= idle <= max_spare and
    // stay there.
    for start_idle in 0..=8 {
        for busy in 0..=4 {
            let (mut idle, busy) = (start_idle, busy);
            for _ in 0..10 {
                let p = plan(idle, busy, &BOUNDS);
                let (next_idle, _) = apply(idle, busy, p);
                idle = next_idle;
            }
            let total = idle + busy;
            if total < BOUNDS.max_servers {
                assert!(idle >= BOUNDS.min_spare.min(BOUNDS.max_servers - busy));
            }
            assert!(
                idle <= BOUNDS.max_spare || total <= BOUNDS.min_servers,
                "start={start_idle} busy={busy} settled idle={idle}"
            );
        }
    }
}

#[test]
fn test_quiescent_band_is_stable() {
    for idle in BOUNDS.min_spare..=BOUNDS.max_spare {
        for busy in 0..=(BOUNDS.max_servers - idle) {
            if idle + busy < BOUNDS.min_servers {
                continue;
            }
            let p = plan(idle, busy, &BOUNDS);
            assert_eq!(
                p,
                PoolPlan { spawn: 0, retire: 0 },
                "band state idle={idle} busy={busy} must be stable"
            );
        }
    }
}

// =============================================================================
// Request-Budget Churn
// =============================================================================

/// Simulates worker churn: sequential connections against a pool
/// whose workers retire after `max_requests` served, checking the
/// spare band at every quiescent point and the per-worker budget
/// overall.
#[test]
fn test_sequential_churn_respects_budget_and_band() {
    const MAX_REQUESTS: usize = 3;
    let bounds = PoolBounds {
        min_servers: 2,
        max_servers: 8,
        min_spare: 2,
        max_spare: 4,
    };

    // Worker model: each entry is one idle worker's served count.
    let mut workers: Vec<usize> = Vec::new();
    let mut total_spawned = 0usize;
    let mut retired_served: Vec<usize> = Vec::new();

    for _connection in 0..20 {
        // Supervisor settles the pool before the connection arrives.
        loop {
            let p = plan(workers.len(), 0, &bounds);
            if p.spawn == 0 && p.retire == 0 {
                break;
            }
            for _ in 0..p.spawn {
                workers.push(0);
                total_spawned += 1;
            }
            for _ in 0..p.retire {
                if let Some(w) = workers.pop() {
                    retired_served.push(w);
                }
            }
        }

        // Quiescent point: the spare band holds.
        assert!(workers.len() >= bounds.min_spare);
        assert!(workers.len() <= bounds.max_spare);

        // One connection: a worker serves and either returns to idle
        // or exits on budget exhaustion.
        let mut served = workers.remove(0);
        served += 1;
        assert!(served <= MAX_REQUESTS, "worker exceeded its budget");
        if served == MAX_REQUESTS {
            retired_served.push(served);
        } else {
            workers.push(served);
        }
    }

    // Every retired worker stayed within budget, and churn actually
    // happened (20 connections / budget 3 forces replacements).
    assert!(retired_served.iter().all(|s| *s <= MAX_REQUESTS));
    assert!(total_spawned > bounds.max_spare);
}
