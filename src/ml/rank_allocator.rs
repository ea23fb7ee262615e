// ============================================================
// Layer 5: AdaLoRA Rank Allocator
// ============================================================
// Decides, after each optimizer step, how many singular triplets
// the adapters may keep in total (the budget) and which ones.
//
// Importance of one parameter entry p with gradient g:
//
//   I   = |p · g|
//   Ī  ← β1 Ī + (1 − β1) I            (smoothed sensitivity)
//   Ū  ← β2 Ū + (1 − β2) |I − Ī|      (uncertainty)
//   s   = Ī · Ū
//
// Triplet k of an adapter scores
//
//   S_k = s(E_k) + mean_j s(A_kj) + mean_i s(B_ik)
//
// Budget schedule over `total` steps (cubic decay):
//
//   step ≤ tinit                 → init budget, no masking
//   step > total − tfinal        → target budget
//   otherwise                    → target + (init − target)·(1 − progress)³
//
// Everything here works on host copies of the adapter tensors.
// The allocator never touches the device; it returns keep masks
// that the model applies to its E vectors.

use std::collections::{BTreeMap, HashMap};

use super::adalora::AdaLoraConfig;

/// Host copy of one adapter's parameters and gradients after an
/// optimizer step. Missing gradients are read as zeros.
#[derive(Debug, Clone)]
pub struct AdapterSnapshot {
    /// Rank-pattern key, `<module path>.lora_E`
    pub name:    String,
    pub rank:    usize,
    pub a:       Vec<f32>, // [rank, in]
    pub a_grad:  Option<Vec<f32>>,
    pub e:       Vec<f32>, // [rank, 1]
    pub e_grad:  Option<Vec<f32>>,
    pub b:       Vec<f32>, // [out, rank]
    pub b_grad:  Option<Vec<f32>>,
}

/// Host copies of an adapter's gradients, taken before the
/// optimizer consumes them.
#[derive(Debug, Clone, Default)]
pub struct AdapterGrads {
    pub a: Option<Vec<f32>>,
    pub e: Option<Vec<f32>>,
    pub b: Option<Vec<f32>>,
}

/// What the allocator asks the model to do after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    /// Keep E as it is.
    Unchanged { budget: usize },
    /// Zero the triplets marked false, per adapter.
    Mask { budget: usize, pattern: BTreeMap<String, Vec<bool>> },
}

impl Allocation {
    pub fn budget(&self) -> usize {
        match self {
            Allocation::Unchanged { budget } | Allocation::Mask { budget, .. } => *budget,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Smoothed {
    ipt: Vec<f32>,
    unc: Vec<f32>,
}

impl Smoothed {
    fn update(&mut self, values: &[f32], grads: Option<&[f32]>, beta1: f32, beta2: f32) {
        if self.ipt.len() != values.len() {
            self.ipt = vec![0.0; values.len()];
            self.unc = vec![0.0; values.len()];
        }
        for (i, &p) in values.iter().enumerate() {
            let g   = grads.and_then(|g| g.get(i)).copied().unwrap_or(0.0);
            let ipt = (p * g).abs();
            self.ipt[i] = beta1 * self.ipt[i] + (1.0 - beta1) * ipt;
            self.unc[i] = beta2 * self.unc[i] + (1.0 - beta2) * (ipt - self.ipt[i]).abs();
        }
    }

    fn score(&self, i: usize) -> f32 {
        self.ipt.get(i).copied().unwrap_or(0.0) * self.unc.get(i).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default)]
struct AdapterStats {
    a: Smoothed,
    e: Smoothed,
    b: Smoothed,
}

pub struct RankAllocator {
    init_bgt:     usize,
    target_bgt:   usize,
    tinit:        usize,
    tfinal:       usize,
    total_step:   usize,
    delta_t:      usize,
    beta1:        f32,
    beta2:        f32,
    stats:        HashMap<String, AdapterStats>,
    rank_pattern: Option<BTreeMap<String, Vec<bool>>>,
}

impl RankAllocator {
    /// `num_adapters` projections each start at `init_r` triplets.
    pub fn new(config: &AdaLoraConfig, num_adapters: usize, total_step: usize) -> Self {
        Self {
            init_bgt:     config.init_r * num_adapters,
            target_bgt:   config.target_r * num_adapters,
            tinit:        config.tinit,
            tfinal:       config.tfinal,
            total_step,
            delta_t:      config.delta_t.max(1),
            beta1:        config.beta1 as f32,
            beta2:        config.beta2 as f32,
            stats:        HashMap::new(),
            rank_pattern: config.rank_pattern.clone(),
        }
    }

    pub fn init_budget(&self) -> usize {
        self.init_bgt
    }

    pub fn target_budget(&self) -> usize {
        self.target_bgt
    }

    pub fn rank_pattern(&self) -> Option<&BTreeMap<String, Vec<bool>>> {
        self.rank_pattern.as_ref()
    }

    /// Budget at `step` and whether masking is due.
    pub fn budget_schedule(&self, step: usize) -> (usize, bool) {
        let final_start = self.total_step.saturating_sub(self.tfinal);
        if step <= self.tinit {
            (self.init_bgt, false)
        } else if step > final_start {
            (self.target_bgt, true)
        } else {
            let span     = final_start.saturating_sub(self.tinit).max(1) as f64;
            let progress = (step - self.tinit) as f64 / span;
            let coeff    = (1.0 - progress).powi(3);
            let spread   = (self.init_bgt - self.target_bgt) as f64;
            let budget   = (spread * coeff + self.target_bgt as f64) as usize;
            (budget, step % self.delta_t == 0)
        }
    }

    /// Run the allocator for 1-based `global_step`.
    pub fn update_and_allocate(&mut self, global_step: usize, snapshots: &[AdapterSnapshot]) -> Allocation {
        let final_start = self.total_step.saturating_sub(self.tfinal);

        if global_step < final_start {
            self.update_importance(snapshots);
            let (budget, mask_due) = self.budget_schedule(global_step);
            if !mask_due {
                return Allocation::Unchanged { budget };
            }
            match self.mask_to_budget(budget, snapshots) {
                Some(pattern) => {
                    self.rank_pattern = Some(pattern.clone());
                    Allocation::Mask { budget, pattern }
                }
                None => Allocation::Unchanged { budget },
            }
        } else if global_step == final_start {
            let (budget, _) = self.budget_schedule(global_step);
            let pattern = self
                .mask_to_budget(budget, snapshots)
                .or_else(|| self.rank_pattern.clone())
                .unwrap_or_else(|| full_pattern(snapshots));
            tracing::info!("Rank pattern frozen at step {global_step} with budget {budget}");
            self.rank_pattern = Some(pattern.clone());
            self.stats.clear();
            Allocation::Mask { budget, pattern }
        } else {
            match &self.rank_pattern {
                Some(pattern) => Allocation::Mask { budget: self.target_bgt, pattern: pattern.clone() },
                None => Allocation::Unchanged { budget: self.target_bgt },
            }
        }
    }

    fn update_importance(&mut self, snapshots: &[AdapterSnapshot]) {
        let (beta1, beta2) = (self.beta1, self.beta2);
        for snap in snapshots {
            let stats = self.stats.entry(snap.name.clone()).or_default();
            stats.a.update(&snap.a, snap.a_grad.as_deref(), beta1, beta2);
            stats.e.update(&snap.e, snap.e_grad.as_deref(), beta1, beta2);
            stats.b.update(&snap.b, snap.b_grad.as_deref(), beta1, beta2);
        }
    }

    /// Triplet scores per adapter, in snapshot order.
    fn triplet_scores(&self, snapshots: &[AdapterSnapshot]) -> Vec<(String, Vec<f32>)> {
        let unseen = AdapterStats::default();
        snapshots
            .iter()
            .map(|snap| {
                let r     = snap.rank;
                let stats = self.stats.get(&snap.name).unwrap_or(&unseen);
                let d_in  = if r == 0 { 0 } else { snap.a.len() / r };
                let d_out = if r == 0 { 0 } else { snap.b.len() / r };

                let scores = (0..r)
                    .map(|k| {
                        let e_score = stats.e.score(k);
                        let a_score = mean((0..d_in).map(|j| stats.a.score(k * d_in + j)), d_in);
                        let b_score = mean((0..d_out).map(|i| stats.b.score(i * r + k)), d_out);
                        e_score + a_score + b_score
                    })
                    .collect();
                (snap.name.clone(), scores)
            })
            .collect()
    }

    /// Keep the `budget` highest-scoring triplets across all adapters.
    /// Returns None when nothing has to be pruned.
    fn mask_to_budget(&self, budget: usize, snapshots: &[AdapterSnapshot]) -> Option<BTreeMap<String, Vec<bool>>> {
        let k = self.init_bgt.saturating_sub(budget);
        if k == 0 {
            return None;
        }
        let scores = self.triplet_scores(snapshots);
        let mut all: Vec<f32> = scores.iter().flat_map(|(_, s)| s.iter().copied()).collect();
        if all.is_empty() {
            return None;
        }
        all.sort_by(|a, b| a.total_cmp(b));
        let threshold = all[(k - 1).min(all.len() - 1)];

        Some(
            scores
                .into_iter()
                .map(|(name, s)| (name, s.into_iter().map(|v| v > threshold).collect()))
                .collect(),
        )
    }
}

fn mean(values: impl Iterator<Item = f32>, n: usize) -> f32 {
    if n == 0 { 0.0 } else { values.sum::<f32>() / n as f32 }
}

fn full_pattern(snapshots: &[AdapterSnapshot]) -> BTreeMap<String, Vec<bool>> {
    snapshots.iter().map(|s| (s.name.clone(), vec![true; s.rank])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(init_r: usize, target_r: usize) -> AdaLoraConfig {
        AdaLoraConfig { init_r, target_r, ..AdaLoraConfig::default() }
    }

    /// One adapter, rank `r`, in = out = 1, with E gradients chosen so
    /// triplet k has importance proportional to `weights[k]`.
    fn snapshot(name: &str, weights: &[f32]) -> AdapterSnapshot {
        let r = weights.len();
        AdapterSnapshot {
            name:   name.to_string(),
            rank:   r,
            a:      vec![0.0; r],
            a_grad: None,
            e:      vec![1.0; r],
            e_grad: Some(weights.to_vec()),
            b:      vec![0.0; r],
            b_grad: None,
        }
    }

    #[test]
    fn test_budget_schedule_endpoints() {
        let mut cfg = config(12, 8);
        cfg.tinit  = 10;
        cfg.tfinal = 20;
        let alloc = RankAllocator::new(&cfg, 2, 100);

        assert_eq!(alloc.init_budget(), 24);
        assert_eq!(alloc.target_budget(), 16);
        assert_eq!(alloc.budget_schedule(5), (24, false));
        assert_eq!(alloc.budget_schedule(10), (24, false));
        // first step after warm-up: coefficient is just below one
        assert_eq!(alloc.budget_schedule(11).0, 23);
        // end of budgeting phase reaches the target
        assert_eq!(alloc.budget_schedule(80).0, 16);
        assert_eq!(alloc.budget_schedule(81), (16, true));
    }

    #[test]
    fn test_budget_is_non_increasing() {
        let alloc = RankAllocator::new(&config(12, 4), 3, 50);
        let budgets: Vec<usize> = (1..=50).map(|s| alloc.budget_schedule(s).0).collect();
        assert!(budgets.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(*budgets.last().unwrap(), 12);
    }

    #[test]
    fn test_masking_keeps_exactly_budget_triplets() {
        let mut alloc = RankAllocator::new(&config(4, 2), 2, 10);
        let snaps = vec![
            snapshot("l0.lora_E", &[0.1, 0.9, 0.3, 0.7]),
            snapshot("l1.lora_E", &[0.5, 0.2, 0.8, 0.4]),
        ];
        alloc.update_importance(&snaps);
        alloc.update_importance(&snaps);

        let pattern = alloc.mask_to_budget(5, &snaps).unwrap();
        let kept: usize = pattern.values().flatten().filter(|&&k| k).count();
        assert_eq!(kept, 5);
        assert_eq!(pattern["l0.lora_E"], vec![false, true, false, true]);
        assert_eq!(pattern["l1.lora_E"], vec![true, false, true, true]);
    }

    #[test]
    fn test_no_mask_when_budget_equals_init() {
        let alloc = RankAllocator::new(&config(4, 4), 1, 10);
        let snaps = vec![snapshot("l0.lora_E", &[0.1, 0.2, 0.3, 0.4])];
        assert!(alloc.mask_to_budget(4, &snaps).is_none());
    }

    #[test]
    fn test_final_step_freezes_pattern_and_resets_statistics() {
        let mut alloc = RankAllocator::new(&config(2, 1), 1, 3);
        let snaps = vec![snapshot("l0.lora_E", &[0.1, 0.9])];

        let first = alloc.update_and_allocate(1, &snaps);
        assert!(first.budget() <= 2);

        let frozen = alloc.update_and_allocate(3, &snaps);
        let Allocation::Mask { budget, pattern } = frozen else {
            panic!("final step must mask");
        };
        assert_eq!(budget, 1);
        assert_eq!(pattern["l0.lora_E"].iter().filter(|&&k| k).count(), 1);
        assert!(alloc.stats.is_empty());

        let after = alloc.update_and_allocate(4, &snaps);
        assert_eq!(after, Allocation::Mask { budget: 1, pattern });
    }

    #[test]
    fn test_missing_gradients_count_as_zero_importance() {
        let mut s = Smoothed::default();
        s.update(&[2.0, 3.0], None, 0.85, 0.85);
        assert_eq!(s.ipt, vec![0.0, 0.0]);
        assert_eq!(s.score(1), 0.0);
    }
}
