// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch-level state machine driving a LayoutModel:
//
//   Training             → shuffled DataLoader pass, one step per batch
//   Evaluating           → sequential held-out pass, no gradients
//   Checkpointing        → epoch snapshot, best snapshot, samples
//   AwaitingContinuation → ask the policy for more epochs
//   Terminated
//
// Per training batch:
//   rate  = start + (end - start) * U
//   batch = mask(rows, rate)
//   loss  = mean(per-replica losses), backward
//   scan gradients → any non-finite value aborts the pass, no step
//   step at the current lr, iteration += 1
//   lr    = base * multiplier(iteration)
//
// The iteration counter only moves on an applied step. It drives
// the lr schedule and keys every telemetry row.

use anyhow::Result;

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    batcher::{self, RowBatch, RowLoader},
    dataset::LayoutDataset,
};
use crate::domain::continuation::ContinuationDecision;
use crate::domain::replication::ModelHandle;
use crate::domain::traits::{
    ContinuationPolicy, EvalPassRecord, LayoutModel, ParameterSnapshot, Sampler, TelemetrySink,
    TrainStepRecord,
};
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::masking::MaskingEngine;
use crate::ml::sampler::EvaluationSampler;
use crate::ml::schedule::{LrSchedule, MaskRateRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Training,
    Evaluating,
    Checkpointing,
    AwaitingContinuation,
    Terminated,
}

/// How a training pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed { steps: usize },
    /// Batch `batch` produced non-finite gradients; no step was applied for it.
    Aborted { batch: usize, parameters: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub epochs:     usize,
    pub iterations: u64,
    pub best_loss:  f64,
}

pub struct Trainer<M> {
    model:        ModelHandle<M>,
    train_set:    LayoutDataset,
    eval_set:     Option<LayoutDataset>,
    cfg:          TrainConfig,
    masking:      MaskingEngine,
    train_loader: RowLoader,
    eval_loader:  Option<RowLoader>,
    lr_schedule:  LrSchedule,
    mask_rates:   MaskRateRange,
    checkpoints:  CheckpointManager,
    telemetry:    Box<dyn TelemetrySink>,
    continuation: Box<dyn ContinuationPolicy>,
    iterations:   u64,
    lr:           f64,
    best_loss:    f64,
    max_epochs:   usize,
}

impl<M> Trainer<M>
where
    M: LayoutModel + ParameterSnapshot + Sampler,
{
    pub fn new(
        model:        ModelHandle<M>,
        train_set:    LayoutDataset,
        eval_set:     Option<LayoutDataset>,
        cfg:          TrainConfig,
        checkpoints:  CheckpointManager,
        telemetry:    Box<dyn TelemetrySink>,
        continuation: Box<dyn ContinuationPolicy>,
    ) -> Self {
        let masking = MaskingEngine::new(train_set.tokens(), cfg.seed);
        let train_loader = batcher::train_loader(train_set.clone(), cfg.batch_size, cfg.seed);
        let eval_loader  = eval_set.clone().map(|set| batcher::eval_loader(set, cfg.batch_size));
        Self {
            model,
            train_set,
            eval_set,
            masking,
            train_loader,
            eval_loader,
            lr_schedule:  LrSchedule::new(cfg.warmup_iters, cfg.final_iters),
            mask_rates:   MaskRateRange::new(cfg.start_mask_rate, cfg.end_mask_rate),
            checkpoints,
            telemetry,
            continuation,
            iterations:   0,
            lr:           cfg.learning_rate,
            best_loss:    f64::INFINITY,
            max_epochs:   cfg.max_epochs,
            cfg,
        }
    }

    // ── Driver ────────────────────────────────────────────────────────────────

    /// Run epochs until the continuation policy says stop.
    pub fn train(&mut self) -> Result<TrainSummary> {
        let mut state     = LoopState::Training;
        let mut epoch     = 0usize;
        let mut test_loss = None;

        loop {
            state = match state {
                LoopState::Training => {
                    epoch += 1;
                    self.run_train_pass(epoch)?;
                    if self.eval_set.is_some() {
                        LoopState::Evaluating
                    } else {
                        test_loss = None;
                        LoopState::Checkpointing
                    }
                }
                LoopState::Evaluating => {
                    test_loss = self.run_eval_pass()?;
                    LoopState::Checkpointing
                }
                LoopState::Checkpointing => {
                    self.end_epoch(epoch, test_loss)?;
                    if epoch >= self.max_epochs {
                        LoopState::AwaitingContinuation
                    } else {
                        LoopState::Training
                    }
                }
                LoopState::AwaitingContinuation => match self.continuation.decide(epoch)? {
                    ContinuationDecision::ContinueFor(extra) => {
                        self.max_epochs += extra;
                        tracing::info!("Continuing training up to epoch {}", self.max_epochs);
                        LoopState::Training
                    }
                    ContinuationDecision::Stop => LoopState::Terminated,
                },
                LoopState::Terminated => break,
            };
        }

        Ok(TrainSummary { epochs: epoch, iterations: self.iterations, best_loss: self.best_loss })
    }

    // ── Training pass ─────────────────────────────────────────────────────────

    /// One shuffled pass over the training set.
    pub fn run_train_pass(&mut self, epoch: usize) -> Result<PassOutcome> {
        let total    = self.train_loader.num_items().div_ceil(self.cfg.batch_size.max(1));
        let replicas = self.model.replicas();
        let mut steps = 0;

        for (it, rows) in self.train_loader.iter().enumerate() {
            let mask_rate = self.mask_rates.sample(self.masking.uniform());
            let batch     = self.masking.mask_batch(&rows, mask_rate);

            let (losses, grads) = self.model.canonical().forward_backward(&batch, replicas)?;
            let loss = mean(&losses);

            let corrupt = self.model.canonical().non_finite_gradients(&grads);
            if !corrupt.is_empty() {
                tracing::warn!(
                    "epoch {} iter {}: non-finite gradients in {:?}, skipping rest of epoch",
                    epoch, it, corrupt
                );
                return Ok(PassOutcome::Aborted { batch: it, parameters: corrupt });
            }

            self.model.canonical_mut().apply_step(self.lr, grads);
            self.iterations += 1;
            steps += 1;
            self.lr = if self.cfg.lr_decay {
                self.cfg.learning_rate * self.lr_schedule.multiplier(self.iterations)
            } else {
                self.cfg.learning_rate
            };

            self.telemetry.log_train_step(
                self.iterations,
                &TrainStepRecord { loss, lr: self.lr, epoch, mask_rate },
            )?;

            if self.cfg.log_every > 0 && it % self.cfg.log_every == 0 {
                tracing::info!(
                    "epoch {} iter {}/{}: train loss {:.5}, lr {:e}, mask rate {:.3}",
                    epoch, it, total, loss, self.lr, mask_rate
                );
                tracing::debug!("masked positions per row: {:?}", batch.masked_counts());
            }
        }

        Ok(PassOutcome::Completed { steps })
    }

    // ── Evaluation pass ───────────────────────────────────────────────────────

    /// One sequential pass over the held-out set. The mask rate ramps from
    /// start to end across the batches. None when there is nothing to score.
    pub fn run_eval_pass(&mut self) -> Result<Option<f64>> {
        let Some(loader) = &self.eval_loader else {
            return Ok(None);
        };
        let batches: Vec<RowBatch> = loader.iter().collect();
        let total    = batches.len();
        let replicas = self.model.replicas();

        let mut losses = Vec::with_capacity(total);
        for (it, rows) in batches.iter().enumerate() {
            let mask_rate = self.mask_rates.ramp(it, total);
            let batch     = self.masking.mask_batch_seeded(rows, mask_rate);
            let per_shard = self.model.canonical().evaluate(&batch, replicas)?;
            losses.push(mean(&per_shard));
        }

        let (Some(&first), Some(&last)) = (losses.first(), losses.last()) else {
            return Ok(None);
        };
        let record = EvalPassRecord { mean_loss: mean(&losses), first_batch_loss: first, last_batch_loss: last };
        self.telemetry.log_eval_pass(self.iterations, &record)?;
        Ok(Some(record.mean_loss))
    }

    // ── End of epoch ──────────────────────────────────────────────────────────

    fn end_epoch(&mut self, epoch: usize, test_loss: Option<f64>) -> Result<()> {
        self.checkpoints.save(&self.model, Some(epoch))?;

        let good_model = match test_loss {
            Some(loss) => loss < self.best_loss,
            None       => true,
        };
        tracing::info!("epoch {} done: test loss {:?}, good model {}", epoch, test_loss, good_model);

        if good_model {
            if let Some(loss) = test_loss {
                self.best_loss = loss;
            }
            self.checkpoints.save(&self.model, None)?;
        }

        if self.sampling_due(epoch) {
            let source  = self.eval_set.as_ref().unwrap_or(&self.train_set);
            let samples = EvaluationSampler::run(self.model.canonical_mut(), source, &self.masking, epoch)?;
            self.telemetry.log_samples(self.iterations, &samples)?;
        }
        Ok(())
    }

    fn sampling_due(&self, epoch: usize) -> bool {
        self.cfg.samples_dir.is_some()
            && self.cfg.sample_every > 0
            && (epoch + 1) % self.cfg.sample_every == 0
    }
}

#[cfg(test)]
impl<M> Trainer<M> {
    pub fn iterations(&self) -> u64 { self.iterations }

    pub fn learning_rate(&self) -> f64 { self.lr }

    pub fn best_loss(&self) -> f64 { self.best_loss }

    pub fn max_epochs(&self) -> usize { self.max_epochs }

    pub fn model(&self) -> &ModelHandle<M> { &self.model }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::layout::{MaskedBatch, SpecialTokens};
    use crate::domain::traits::{DecodeConfig, SampleSet};
    use std::{cell::{Cell, RefCell}, collections::VecDeque, fs, path::Path, rc::Rc};

    const TOKENS: SpecialTokens = SpecialTokens { pad: 0, eos: 1, mask: 2 };

    // ── Scripted model ────────────────────────────────────────────────────────
    /// One scalar parameter. Gradients are always 1.0 unless the scripted
    /// forward call is poisoned with NaN.
    #[derive(Default)]
    struct ScriptedModel {
        weight:          f64,
        calls:           Cell<usize>,
        poisoned_calls:  Vec<usize>,
        steps:           Vec<f64>,
        /// Held-out loss per epoch; None scores the masked fraction instead.
        eval_script:     Option<Vec<f64>>,
        steps_per_epoch: usize,
    }

    impl LayoutModel for ScriptedModel {
        type Gradients = Vec<f64>;

        fn forward_backward(&self, batch: &MaskedBatch, replicas: usize) -> Result<(Vec<f64>, Vec<f64>)> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            let losses = (1..=batch.shards(replicas).len()).map(|i| i as f64).collect();
            let grad   = if self.poisoned_calls.contains(&call) { f64::NAN } else { 1.0 };
            Ok((losses, vec![grad]))
        }

        fn evaluate(&self, batch: &MaskedBatch, replicas: usize) -> Result<Vec<f64>> {
            let loss = match &self.eval_script {
                Some(script) => {
                    let epoch = (self.steps.len() / self.steps_per_epoch.max(1)).saturating_sub(1);
                    script[epoch.min(script.len() - 1)]
                }
                None => {
                    let masked: usize = batch.masked_counts().iter().sum();
                    masked as f64 / (batch.rows() * batch.seq_len()) as f64
                }
            };
            Ok(vec![loss; batch.shards(replicas).len()])
        }

        fn non_finite_gradients(&self, grads: &Vec<f64>) -> Vec<String> {
            grads
                .iter()
                .enumerate()
                .filter(|(_, g)| !g.is_finite())
                .map(|(i, _)| format!("weight.{i}"))
                .collect()
        }

        fn apply_step(&mut self, lr: f64, grads: Vec<f64>) {
            self.weight -= lr * grads[0];
            self.steps.push(lr);
        }
    }

    impl ParameterSnapshot for ScriptedModel {
        fn save_parameters(&self, path: &Path) -> Result<()> {
            fs::write(path.with_extension("json"), serde_json::to_string(&self.weight)?)?;
            Ok(())
        }

        fn load_parameters(&mut self, path: &Path) -> Result<()> {
            self.weight = serde_json::from_str(&fs::read_to_string(path.with_extension("json"))?)?;
            Ok(())
        }
    }

    impl Sampler for ScriptedModel {
        fn sample(&mut self, batch: &MaskedBatch, _: &DecodeConfig) -> Result<Vec<Vec<u32>>> {
            Ok(batch.targets.clone())
        }
    }

    // ── Recording collaborators ───────────────────────────────────────────────
    #[derive(Default)]
    struct Recorded {
        steps:   Vec<(u64, TrainStepRecord)>,
        evals:   Vec<(u64, EvalPassRecord)>,
        samples: Vec<(u64, usize)>,
    }

    struct RecordingSink(Rc<RefCell<Recorded>>);

    impl TelemetrySink for RecordingSink {
        fn log_train_step(&mut self, iteration: u64, record: &TrainStepRecord) -> Result<()> {
            self.0.borrow_mut().steps.push((iteration, *record));
            Ok(())
        }

        fn log_eval_pass(&mut self, iteration: u64, record: &EvalPassRecord) -> Result<()> {
            self.0.borrow_mut().evals.push((iteration, *record));
            Ok(())
        }

        fn log_samples(&mut self, iteration: u64, samples: &SampleSet) -> Result<()> {
            self.0.borrow_mut().samples.push((iteration, samples.epoch));
            Ok(())
        }
    }

    struct ScriptedAnswers {
        answers: VecDeque<&'static str>,
        asked:   Rc<RefCell<Vec<usize>>>,
    }

    impl ContinuationPolicy for ScriptedAnswers {
        fn decide(&mut self, epoch: usize) -> Result<ContinuationDecision> {
            self.asked.borrow_mut().push(epoch);
            Ok(ContinuationDecision::parse(self.answers.pop_front().unwrap_or("")))
        }
    }

    // ── Fixtures ──────────────────────────────────────────────────────────────
    fn rows(n: usize) -> Vec<Vec<u32>> {
        (0..n as u32)
            .map(|i| vec![5, 10 + i % 5, 11, 12, 13, 14, 15, 1, 0, 0])
            .collect()
    }

    fn dataset(n: usize) -> LayoutDataset {
        LayoutDataset::new(rows(n), TOKENS, 10)
    }

    fn config(max_epochs: usize) -> TrainConfig {
        TrainConfig {
            max_epochs,
            batch_size:    2,
            learning_rate: 1e-3,
            warmup_iters:  4,
            final_iters:   20,
            log_every:     1,
            ..TrainConfig::default()
        }
    }

    struct Harness {
        trainer:  Trainer<ScriptedModel>,
        recorded: Rc<RefCell<Recorded>>,
        asked:    Rc<RefCell<Vec<usize>>>,
        dir:      tempfile::TempDir,
    }

    fn harness(
        model:    ScriptedModel,
        replicas: usize,
        eval_set: Option<LayoutDataset>,
        cfg:      TrainConfig,
        answers:  &[&'static str],
    ) -> Harness {
        let dir      = tempfile::tempdir().unwrap();
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        let asked    = Rc::new(RefCell::new(Vec::new()));
        let trainer  = Trainer::new(
            ModelHandle::new(model, replicas),
            dataset(8),
            eval_set,
            cfg,
            CheckpointManager::new(dir.path()).unwrap(),
            Box::new(RecordingSink(Rc::clone(&recorded))),
            Box::new(ScriptedAnswers { answers: answers.iter().copied().collect(), asked: Rc::clone(&asked) }),
        );
        Harness { trainer, recorded, asked, dir }
    }

    fn snapshot(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(format!("{name}.json"))).unwrap()
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_nan_gradient_aborts_pass_without_step() {
        let model = ScriptedModel { poisoned_calls: vec![1], ..ScriptedModel::default() };
        let mut h = harness(model, 1, None, config(1), &[]);

        let outcome = h.trainer.run_train_pass(1).unwrap();
        assert_eq!(outcome, PassOutcome::Aborted { batch: 1, parameters: vec!["weight.0".into()] });
        assert_eq!(h.trainer.iterations(), 1);
        assert_eq!(h.trainer.model().canonical().steps.len(), 1);
        assert_eq!(h.recorded.borrow().steps.len(), 1);
    }

    #[test]
    fn test_nan_on_first_batch_leaves_counter_at_zero() {
        let model = ScriptedModel { poisoned_calls: vec![0], ..ScriptedModel::default() };
        let mut h = harness(model, 1, None, config(1), &[]);
        let lr_before = h.trainer.learning_rate();

        assert!(matches!(h.trainer.run_train_pass(1).unwrap(), PassOutcome::Aborted { batch: 0, .. }));
        assert_eq!(h.trainer.iterations(), 0);
        assert_eq!(h.trainer.learning_rate(), lr_before);
        assert_eq!(h.trainer.model().canonical().weight, 0.0);
    }

    #[test]
    fn test_loop_resumes_on_epoch_after_abort() {
        let model = ScriptedModel { poisoned_calls: vec![0], ..ScriptedModel::default() };
        let mut h = harness(model, 1, None, config(2), &["abc"]);

        let summary = h.trainer.train().unwrap();
        assert_eq!(summary.epochs, 2);
        // Epoch 1 aborted on its first batch, epoch 2 ran all four.
        assert_eq!(summary.iterations, 4);
        assert!(h.dir.path().join("checkpoint_epoch_1.json").exists());
        assert!(h.dir.path().join("checkpoint_epoch_2.json").exists());
    }

    #[test]
    fn test_lr_follows_schedule_from_new_counter() {
        let mut h = harness(ScriptedModel::default(), 1, None, config(2), &[]);
        h.trainer.train().unwrap();

        let schedule = LrSchedule::new(4, 20);
        let recorded = h.recorded.borrow();
        assert_eq!(recorded.steps.len(), 8);
        for (i, (iteration, step)) in recorded.steps.iter().enumerate() {
            assert_eq!(*iteration, i as u64 + 1);
            assert!((step.lr - 1e-3 * schedule.multiplier(*iteration)).abs() < 1e-15);
        }

        // The first step runs at the base rate, later ones at the scheduled one.
        let applied = &h.trainer.model().canonical().steps;
        assert_eq!(applied[0], 1e-3);
        assert!((applied[1] - 1e-3 * schedule.multiplier(1)).abs() < 1e-15);
    }

    #[test]
    fn test_lr_stays_at_base_without_decay() {
        let cfg   = TrainConfig { lr_decay: false, ..config(1) };
        let mut h = harness(ScriptedModel::default(), 1, None, cfg, &[]);
        h.trainer.train().unwrap();
        assert!(h.trainer.model().canonical().steps.iter().all(|&lr| lr == 1e-3));
    }

    #[test]
    fn test_train_mask_rate_stays_in_range() {
        let cfg   = TrainConfig { start_mask_rate: 0.2, end_mask_rate: 0.4, ..config(3) };
        let mut h = harness(ScriptedModel::default(), 1, None, cfg, &[]);
        h.trainer.train().unwrap();
        for (_, step) in &h.recorded.borrow().steps {
            assert!((0.2..0.4).contains(&step.mask_rate));
        }
    }

    #[test]
    fn test_replica_losses_are_averaged() {
        let mut h = harness(ScriptedModel::default(), 2, None, config(1), &[]);
        h.trainer.run_train_pass(1).unwrap();
        // Shard losses are 1.0 and 2.0.
        assert!(h.recorded.borrow().steps.iter().all(|(_, s)| (s.loss - 1.5).abs() < 1e-12));
    }

    #[test]
    fn test_eval_ramp_makes_last_batch_hardest() {
        // Identical rows, so a higher rate can only mask more positions.
        let eval  = LayoutDataset::new(vec![rows(1)[0].clone(); 6], TOKENS, 10);
        let mut h = harness(ScriptedModel::default(), 1, Some(eval), config(1), &[]);

        let mean_loss = h.trainer.run_eval_pass().unwrap().unwrap();
        let recorded  = h.recorded.borrow();
        let (iteration, pass) = recorded.evals[0];
        assert_eq!(iteration, 0);
        assert!(pass.first_batch_loss < pass.last_batch_loss);
        assert_eq!(pass.mean_loss, mean_loss);
    }

    #[test]
    fn test_eval_pass_leaves_training_stream_alone() {
        let eval  = dataset(4);
        let mut a = harness(ScriptedModel::default(), 1, Some(eval.clone()), config(1), &[]);
        let mut b = harness(ScriptedModel::default(), 1, Some(eval), config(1), &[]);

        a.trainer.run_eval_pass().unwrap();
        a.trainer.run_train_pass(1).unwrap();
        b.trainer.run_train_pass(1).unwrap();

        let rates = |h: &Harness| -> Vec<f64> {
            h.recorded.borrow().steps.iter().map(|(_, s)| s.mask_rate).collect()
        };
        assert_eq!(rates(&a), rates(&b));
    }

    #[test]
    fn test_best_checkpoint_only_on_improvement() {
        let model = ScriptedModel {
            eval_script:     Some(vec![3.0, 2.0, 2.5]),
            steps_per_epoch: 4,
            ..ScriptedModel::default()
        };
        let mut h = harness(model, 1, Some(dataset(4)), config(3), &[]);
        let summary = h.trainer.train().unwrap();

        assert_eq!(summary.best_loss, 2.0);
        let dir = h.dir.path();
        assert_eq!(snapshot(dir, "checkpoint_best"), snapshot(dir, "checkpoint_epoch_2"));
        assert_ne!(snapshot(dir, "checkpoint_best"), snapshot(dir, "checkpoint_epoch_3"));
        assert_eq!(h.recorded.borrow().evals.len(), 3);
    }

    #[test]
    fn test_without_eval_set_every_epoch_is_best() {
        let mut h = harness(ScriptedModel::default(), 1, None, config(2), &[]);
        h.trainer.train().unwrap();

        let dir = h.dir.path();
        assert_eq!(snapshot(dir, "checkpoint_best"), snapshot(dir, "checkpoint_epoch_2"));
        assert_eq!(h.trainer.best_loss(), f64::INFINITY);
        assert!(h.recorded.borrow().evals.is_empty());
    }

    #[test]
    fn test_continuation_extends_then_stops() {
        let mut h = harness(ScriptedModel::default(), 1, None, config(1), &["3", "abc"]);
        let summary = h.trainer.train().unwrap();

        assert_eq!(summary.epochs, 4);
        assert_eq!(h.trainer.max_epochs(), 4);
        assert_eq!(*h.asked.borrow(), vec![1, 4]);
        assert!(h.dir.path().join("checkpoint_epoch_4.json").exists());
    }

    #[test]
    fn test_non_positive_answer_stops_immediately() {
        let mut h = harness(ScriptedModel::default(), 1, None, config(2), &["0"]);
        assert_eq!(h.trainer.train().unwrap().epochs, 2);
        assert_eq!(*h.asked.borrow(), vec![2]);
    }

    #[test]
    fn test_sampling_follows_cadence() {
        let cfg = TrainConfig {
            samples_dir:  Some("unused".into()),
            sample_every: 2,
            ..config(4)
        };
        let mut h = harness(ScriptedModel::default(), 1, None, cfg, &[]);
        h.trainer.train().unwrap();

        let epochs: Vec<usize> = h.recorded.borrow().samples.iter().map(|&(_, e)| e).collect();
        assert_eq!(epochs, vec![1, 3]);
    }

    #[test]
    fn test_no_sampling_without_samples_dir() {
        let mut h = harness(ScriptedModel::default(), 1, None, config(2), &[]);
        h.trainer.train().unwrap();
        assert!(h.recorded.borrow().samples.is_empty());
    }
}
