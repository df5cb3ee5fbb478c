//! Instance selection.
//!
//! Selection never suspends: all bookkeeping sits behind plain mutexes and
//! every strategy is O(candidates). Candidates are pre-sorted by id so that
//! ties resolve the same way on every run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use rand::Rng;
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};
use crate::registry::{Instance, Strategy};

/// Probes remembered per instance for the health-based score.
pub const HEALTH_WINDOW: usize = 10;

#[derive(Default)]
struct TemplateState {
    rr_counter: usize,
    /// Currently forwarded requests per instance.
    active: HashMap<String, usize>,
    /// Smooth weighted round-robin running counters.
    wrr_current: HashMap<String, i64>,
    /// Recent probe outcomes, oldest first.
    probe_history: HashMap<String, VecDeque<bool>>,
}

/// Per-template selection state keyed by template id.
pub struct LoadBalancer {
    templates: Mutex<HashMap<String, TemplateState>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub active_requests: usize,
    pub tracked_templates: usize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            templates: Mutex::new(HashMap::new()),
        }
    }

    /// Pick a healthy instance for a template.
    ///
    /// `excluded` holds instances already tried (and failed) during the
    /// current request; they stay out of the pool for its remainder.
    pub fn select(
        &self,
        template_id: &str,
        strategy: Strategy,
        instances: &[Instance],
        excluded: &HashSet<String>,
    ) -> GatewayResult<Instance> {
        let mut candidates: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.is_healthy() && !excluded.contains(&i.id))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstances(template_id.to_string()));
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let mut templates = self.templates.lock().expect("balancer lock");
        let state = templates.entry(template_id.to_string()).or_default();

        let chosen = match strategy {
            Strategy::RoundRobin => round_robin(state, &candidates),
            Strategy::LeastConnections => least_connections(state, &candidates),
            Strategy::Weighted => weighted(state, &candidates),
            Strategy::HealthBased => health_based(state, &candidates),
            Strategy::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],
        };
        Ok(chosen.clone())
    }

    /// A request is now in flight against this instance.
    pub fn record_request_start(&self, template_id: &str, instance_id: &str) {
        let mut templates = self.templates.lock().expect("balancer lock");
        let state = templates.entry(template_id.to_string()).or_default();
        *state.active.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    /// The in-flight request finished.
    pub fn record_request_end(&self, template_id: &str, instance_id: &str) {
        let mut templates = self.templates.lock().expect("balancer lock");
        if let Some(state) = templates.get_mut(template_id) {
            if let Some(count) = state.active.get_mut(instance_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Feed a probe outcome into the health-based window.
    pub fn record_probe(&self, template_id: &str, instance_id: &str, success: bool) {
        let mut templates = self.templates.lock().expect("balancer lock");
        let state = templates.entry(template_id.to_string()).or_default();
        let history = state
            .probe_history
            .entry(instance_id.to_string())
            .or_default();
        history.push_back(success);
        while history.len() > HEALTH_WINDOW {
            history.pop_front();
        }
    }

    /// Forget an instance's bookkeeping (after deregistration).
    pub fn forget_instance(&self, template_id: &str, instance_id: &str) {
        let mut templates = self.templates.lock().expect("balancer lock");
        if let Some(state) = templates.get_mut(template_id) {
            state.active.remove(instance_id);
            state.wrr_current.remove(instance_id);
            state.probe_history.remove(instance_id);
        }
    }

    pub fn stats(&self) -> BalancerStats {
        let templates = self.templates.lock().expect("balancer lock");
        BalancerStats {
            active_requests: templates
                .values()
                .flat_map(|s| s.active.values())
                .sum(),
            tracked_templates: templates.len(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

fn round_robin<'a>(state: &mut TemplateState, candidates: &[&'a Instance]) -> &'a Instance {
    let idx = state.rr_counter % candidates.len();
    state.rr_counter = state.rr_counter.wrapping_add(1);
    candidates[idx]
}

fn least_connections<'a>(state: &mut TemplateState, candidates: &[&'a Instance]) -> &'a Instance {
    let min = candidates
        .iter()
        .map(|i| state.active.get(&i.id).copied().unwrap_or(0))
        .min()
        .unwrap_or(0);
    let minima: Vec<&'a Instance> = candidates
        .iter()
        .copied()
        .filter(|i| state.active.get(&i.id).copied().unwrap_or(0) == min)
        .collect();
    // Round-robin among the tied minima.
    let idx = state.rr_counter % minima.len();
    state.rr_counter = state.rr_counter.wrapping_add(1);
    minima[idx]
}

/// Smooth weighted round-robin: add each weight to its running counter,
/// pick the maximum, subtract the weight total from the winner.
fn weighted<'a>(state: &mut TemplateState, candidates: &[&'a Instance]) -> &'a Instance {
    // weight 0 means "never", unless everything is 0 — then uniform.
    let all_zero = candidates.iter().all(|i| i.weight == 0);
    let effective = |i: &Instance| -> i64 {
        if all_zero {
            1
        } else {
            i64::from(i.weight)
        }
    };

    let eligible: Vec<&'a Instance> = candidates
        .iter()
        .copied()
        .filter(|i| effective(*i) > 0)
        .collect();
    let total: i64 = eligible.iter().map(|i| effective(*i)).sum();

    let mut winner: Option<&'a Instance> = None;
    let mut best = i64::MIN;
    for instance in eligible.iter().copied() {
        let current = state.wrr_current.entry(instance.id.clone()).or_insert(0);
        *current += effective(instance);
        if *current > best {
            best = *current;
            winner = Some(instance);
        }
    }

    let winner = winner.expect("eligible set is non-empty");
    *state
        .wrr_current
        .get_mut(&winner.id)
        .expect("winner counter exists") -= total;
    winner
}

/// Recency-weighted success ratio over the probe window; fresh instances
/// with no history score a full 1.0.
fn health_based<'a>(state: &mut TemplateState, candidates: &[&'a Instance]) -> &'a Instance {
    let score = |i: &Instance| -> f64 {
        match state.probe_history.get(&i.id) {
            None => 1.0,
            Some(history) if history.is_empty() => 1.0,
            Some(history) => {
                let mut weighted_sum = 0.0;
                let mut weight_total = 0.0;
                for (age, ok) in history.iter().enumerate() {
                    // Older probes carry less weight.
                    let w = (age + 1) as f64;
                    weight_total += w;
                    if *ok {
                        weighted_sum += w;
                    }
                }
                weighted_sum / weight_total
            }
        }
    };

    let best = candidates
        .iter()
        .map(|i| score(*i))
        .fold(f64::MIN, f64::max);
    let top: Vec<&'a Instance> = candidates
        .iter()
        .copied()
        .filter(|i| (score(*i) - best).abs() < f64::EPSILON)
        .collect();
    let idx = state.rr_counter % top.len();
    state.rr_counter = state.rr_counter.wrapping_add(1);
    top[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceStatus;
    use mcpgrid_template::Transport;

    fn instance(id: &str, weight: u32) -> Instance {
        Instance {
            id: id.to_string(),
            template_id: "demo".to_string(),
            transport: Transport::Http,
            endpoint: Some(format!("http://127.0.0.1:1/{id}")),
            command: None,
            env: None,
            status: InstanceStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 1,
            last_check: None,
            weight,
            deployment_id: None,
            metadata: Default::default(),
        }
    }

    fn ids(selections: &[Instance]) -> Vec<&str> {
        selections.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn round_robin_is_fair_and_deterministic() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
        let none = HashSet::new();

        let picks: Vec<Instance> = (0..9)
            .map(|_| lb.select("demo", Strategy::RoundRobin, &pool, &none).unwrap())
            .collect();
        assert_eq!(
            ids(&picks),
            vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]
        );
    }

    #[test]
    fn unhealthy_instances_are_never_selected() {
        let lb = LoadBalancer::new();
        let mut pool = vec![instance("a", 1), instance("b", 1)];
        pool[0].status = InstanceStatus::Unhealthy;
        let none = HashSet::new();

        for _ in 0..10 {
            let picked = lb.select("demo", Strategy::RoundRobin, &pool, &none).unwrap();
            assert_eq!(picked.id, "b");
        }
    }

    #[test]
    fn empty_healthy_set_fails() {
        let lb = LoadBalancer::new();
        let mut pool = vec![instance("a", 1)];
        pool[0].status = InstanceStatus::Unhealthy;
        let none = HashSet::new();

        let err = lb
            .select("demo", Strategy::Random, &pool, &none)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances(_)));

        let err = lb
            .select("demo", Strategy::RoundRobin, &[], &none)
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances(_)));
    }

    #[test]
    fn exclusion_removes_candidates_for_the_request() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 1), instance("b", 1)];
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());

        for _ in 0..5 {
            let picked = lb
                .select("demo", Strategy::RoundRobin, &pool, &excluded)
                .unwrap();
            assert_eq!(picked.id, "b");
        }

        excluded.insert("b".to_string());
        assert!(lb
            .select("demo", Strategy::RoundRobin, &pool, &excluded)
            .is_err());
    }

    #[test]
    fn single_instance_pool_works() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("only", 1)];
        let none = HashSet::new();
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::Weighted,
            Strategy::HealthBased,
            Strategy::Random,
        ] {
            let picked = lb.select("demo", strategy, &pool, &none).unwrap();
            assert_eq!(picked.id, "only");
        }
    }

    #[test]
    fn least_connections_prefers_the_idle_instance() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 1), instance("b", 1)];
        let none = HashSet::new();

        lb.record_request_start("demo", "a");
        lb.record_request_start("demo", "a");
        lb.record_request_start("demo", "b");

        let picked = lb
            .select("demo", Strategy::LeastConnections, &pool, &none)
            .unwrap();
        assert_eq!(picked.id, "b");

        // Once `a` drains it becomes eligible again.
        lb.record_request_end("demo", "a");
        lb.record_request_end("demo", "a");
        lb.record_request_end("demo", "b");
        lb.record_request_start("demo", "b");
        let picked = lb
            .select("demo", Strategy::LeastConnections, &pool, &none)
            .unwrap();
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn weighted_distributes_proportionally() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 3), instance("b", 1)];
        let none = HashSet::new();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let picked = lb.select("demo", Strategy::Weighted, &pool, &none).unwrap();
            *counts.entry(picked.id).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 6);
        assert_eq!(counts["b"], 2);
    }

    #[test]
    fn weighted_smoothness_interleaves() {
        // Smooth WRR with weights 2:1 yields a, b, a (not a, a, b).
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 2), instance("b", 1)];
        let none = HashSet::new();

        let picks: Vec<Instance> = (0..3)
            .map(|_| lb.select("demo", Strategy::Weighted, &pool, &none).unwrap())
            .collect();
        assert_eq!(ids(&picks), vec!["a", "b", "a"]);
    }

    #[test]
    fn weight_zero_is_never_selected() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 0), instance("b", 1)];
        let none = HashSet::new();

        for _ in 0..10 {
            let picked = lb.select("demo", Strategy::Weighted, &pool, &none).unwrap();
            assert_eq!(picked.id, "b");
        }
    }

    #[test]
    fn all_zero_weights_fall_back_to_uniform() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 0), instance("b", 0)];
        let none = HashSet::new();

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(lb.select("demo", Strategy::Weighted, &pool, &none).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn health_based_prefers_the_better_track_record() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 1), instance("b", 1)];
        let none = HashSet::new();

        for _ in 0..10 {
            lb.record_probe("demo", "a", true);
            lb.record_probe("demo", "b", false);
        }
        // `b` is still marked healthy but its probe record is poor.
        for _ in 0..5 {
            let picked = lb
                .select("demo", Strategy::HealthBased, &pool, &none)
                .unwrap();
            assert_eq!(picked.id, "a");
        }
    }

    #[test]
    fn health_based_recency_outweighs_history() {
        let lb = LoadBalancer::new();
        let pool = vec![instance("a", 1), instance("b", 1)];
        let none = HashSet::new();

        // `a`: old successes, fresh failures. `b`: the reverse.
        for _ in 0..5 {
            lb.record_probe("demo", "a", true);
            lb.record_probe("demo", "b", false);
        }
        for _ in 0..5 {
            lb.record_probe("demo", "a", false);
            lb.record_probe("demo", "b", true);
        }

        let picked = lb
            .select("demo", Strategy::HealthBased, &pool, &none)
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn random_stays_inside_the_healthy_set() {
        let lb = LoadBalancer::new();
        let mut pool = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
        pool[2].status = InstanceStatus::Unhealthy;
        let none = HashSet::new();

        for _ in 0..50 {
            let picked = lb.select("demo", Strategy::Random, &pool, &none).unwrap();
            assert_ne!(picked.id, "c");
        }
    }

    #[test]
    fn stats_count_active_requests() {
        let lb = LoadBalancer::new();
        lb.record_request_start("demo", "a");
        lb.record_request_start("demo", "b");
        lb.record_request_start("other", "x");
        assert_eq!(lb.stats().active_requests, 3);

        lb.record_request_end("demo", "a");
        assert_eq!(lb.stats().active_requests, 2);
    }
}
