//! ST-007: Build orchestrator — a polling state machine per build target.
//!
//! Each enqueued target becomes a BuildJob stepped through launch, stack
//! creation, instance stop, image snapshot, and cleanup. All remote effects
//! go through the reconciler and image store; the driver loop holds no local
//! persistent state, so a crashed run resumes by adopting the stacks its
//! tags identify.

use crate::cloud::images::ImageStore;
use crate::cloud::reconciler::{Reconciler, StackHandle};
use crate::cloud::{ComputeApi, Pacer, StackApi};
use crate::core::error::{Error, Result};
use crate::core::template::{TemplateEngine, BUILD_INSTANCE_LOGICAL_ID};
use crate::core::types::{
    discovery_tags, BuildCandidate, BuildOutcome, BuildSummary, ImageState, InstanceState,
    JobReport, Launchable, Tags, TAG_BASE_AMI, TAG_LAST_PHASE, TAG_OWNER, TAG_STATUS_ID,
};

/// Where a job is in its lifecycle. One remote round-trip per step, at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    /// One-shot discovery of an adoptable stack from a previous run.
    Initial,
    /// Waiting for an admission slot; launches as soon as one frees up.
    LaunchReady,
    /// Stack creation in flight.
    CreateWait,
    /// Creation finished one way or the other; decide which.
    CreatedCheck,
    /// Creation did not complete; classify the failure mode.
    FailureCheck,
    /// Waiting for the build instance to stop.
    InstanceWait,
    /// Snapshot taken; waiting for the image to become available.
    ImageWait,
    /// Terminal bookkeeping: delete the stack, release the slot.
    Cleanup,
    Done,
}

/// One in-flight build target.
struct BuildJob {
    launchable_name: String,
    launchable: Launchable,
    candidate: BuildCandidate,
    target_id: String,
    state: JobState,
    handle: Option<StackHandle>,
    instance_id: Option<String>,
    image_id: Option<String>,
    outcome: Option<BuildOutcome>,
}

impl BuildJob {
    fn stack_name(&self) -> String {
        format!("stratus-build-{}", self.target_id)
    }

    /// Forget remote associations and re-enter admission.
    fn reset(&mut self) {
        self.state = JobState::Initial;
        self.handle = None;
        self.instance_id = None;
    }

    fn finish(&mut self, outcome: BuildOutcome) {
        self.outcome = Some(outcome);
        self.state = JobState::Cleanup;
    }
}

/// Drives a set of build jobs to completion against the cloud.
pub struct Orchestrator<A: StackApi, C: ComputeApi, E: TemplateEngine> {
    reconciler: Reconciler<A>,
    images: ImageStore<C>,
    engine: E,
    owner: String,
    cap: usize,
    jobs: Vec<BuildJob>,
    running: usize,
}

impl<A: StackApi, C: ComputeApi, E: TemplateEngine> Orchestrator<A, C, E> {
    pub fn new(
        reconciler: Reconciler<A>,
        images: ImageStore<C>,
        engine: E,
        owner: &str,
        cap: usize,
    ) -> Self {
        Self {
            reconciler,
            images,
            engine,
            owner: owner.to_string(),
            cap,
            jobs: Vec::new(),
            running: 0,
        }
    }

    /// Queue a build candidate. Targets are content-addressed, so the same
    /// target reached from different launchables is built once; returns
    /// whether the candidate was actually added.
    pub fn enqueue(
        &mut self,
        launchable_name: &str,
        launchable: &Launchable,
        candidate: BuildCandidate,
    ) -> Result<bool> {
        let target_id = candidate
            .target_id
            .clone()
            .ok_or_else(|| Error::job(&candidate.status_id, "candidate has no build target"))?;
        if self.jobs.iter().any(|j| j.target_id == target_id) {
            tracing::debug!(target = %target_id, "target already queued, skipping");
            return Ok(false);
        }
        tracing::info!(
            launchable = launchable_name,
            target = %target_id,
            phases = candidate.remaining.len(),
            "queued build target"
        );
        self.jobs.push(BuildJob {
            launchable_name: launchable_name.to_string(),
            launchable: launchable.clone(),
            candidate,
            target_id,
            state: JobState::Initial,
            handle: None,
            instance_id: None,
            image_id: None,
            outcome: None,
        });
        Ok(true)
    }

    /// Step every unfinished job once, pausing the pacer before each job's
    /// remote round-trip. Returns whether any job still has work left.
    pub fn step_once(&mut self, pacer: &mut Pacer) -> Result<bool> {
        for job in &mut self.jobs {
            if job.state != JobState::Done {
                pacer.pause();
                Self::step_job(
                    &self.reconciler,
                    &self.images,
                    &self.engine,
                    &self.owner,
                    self.cap,
                    &mut self.running,
                    job,
                )?;
            }
        }
        Ok(self.jobs.iter().any(|j| j.state != JobState::Done))
    }

    /// Drive all queued jobs to completion and report per-target outcomes.
    /// A failed target never aborts the run; it shows up in the summary.
    pub fn run(&mut self, pacer: &mut Pacer) -> Result<BuildSummary> {
        while self.step_once(pacer)? {}
        let reports = self
            .jobs
            .drain(..)
            .map(|job| JobReport {
                target_id: job.target_id,
                launchable: job.launchable_name,
                image_id: job.image_id,
                outcome: job.outcome.unwrap_or(BuildOutcome::Failed),
            })
            .collect();
        Ok(BuildSummary { reports })
    }

    fn stack_tags(owner: &str, job: &BuildJob) -> Tags {
        let mut tags = discovery_tags(&job.candidate.base_ami, &job.target_id);
        tags.insert(TAG_OWNER.to_string(), owner.to_string());
        tags
    }

    fn image_tags(job: &BuildJob) -> Tags {
        let mut tags = Tags::from([
            (TAG_BASE_AMI.to_string(), job.candidate.base_ami.clone()),
            (TAG_STATUS_ID.to_string(), job.target_id.clone()),
        ]);
        if let Some(last) = job.candidate.remaining.last() {
            tags.insert(TAG_LAST_PHASE.to_string(), last.name.clone());
        }
        tags
    }

    /// Associated so the caller can hand out disjoint field borrows.
    fn step_job(
        reconciler: &Reconciler<A>,
        images: &ImageStore<C>,
        engine: &E,
        owner: &str,
        cap: usize,
        running: &mut usize,
        job: &mut BuildJob,
    ) -> Result<()> {
        let before = job.state;
        match job.state {
            JobState::Initial => {
                // A stack with our discovery tags is a previous run's work in
                // flight; adopt it instead of launching a second one.
                let found =
                    reconciler.find(&discovery_tags(&job.candidate.base_ami, &job.target_id))?;
                if let Some(handle) = found.into_iter().next() {
                    tracing::info!(target = %job.target_id, stack = %handle.name, "adopting existing build stack");
                    job.handle = Some(handle);
                    job.state = JobState::CreateWait;
                    *running += 1;
                } else {
                    job.state = JobState::LaunchReady;
                }
            }
            JobState::LaunchReady => {
                // Admission happens here, without remote calls while blocked
                if *running >= cap {
                    return Ok(());
                }
                let definition = engine.make_build_stack(
                    &job.launchable_name,
                    &job.launchable,
                    &job.candidate.image,
                    &job.candidate.remaining,
                )?;
                let handle = reconciler.create_or_update(
                    &definition,
                    &job.stack_name(),
                    &Self::stack_tags(owner, job),
                    false,
                )?;
                job.handle = Some(handle);
                job.state = JobState::CreateWait;
                *running += 1;
            }
            JobState::CreateWait => {
                if let Some(ref handle) = job.handle {
                    if !reconciler.is_being_created(handle)? {
                        job.state = JobState::CreatedCheck;
                    }
                } else {
                    job.reset();
                    *running = running.saturating_sub(1);
                }
            }
            JobState::CreatedCheck => {
                let Some(ref handle) = job.handle else {
                    job.reset();
                    *running = running.saturating_sub(1);
                    return Ok(());
                };
                if reconciler.is_created(handle)? {
                    let resources = reconciler.describe_resources(handle)?;
                    match resources.get(BUILD_INSTANCE_LOGICAL_ID) {
                        Some(resource) => {
                            job.instance_id = Some(resource.physical_id.clone());
                            job.state = JobState::InstanceWait;
                        }
                        None => {
                            return Err(Error::job(
                                &job.target_id,
                                "created stack has no build instance resource",
                            ))
                        }
                    }
                } else {
                    job.state = JobState::FailureCheck;
                }
            }
            JobState::FailureCheck => {
                let Some(ref handle) = job.handle else {
                    job.reset();
                    *running = running.saturating_sub(1);
                    return Ok(());
                };
                let status = reconciler.status(handle)?;
                if status.is_failed_or_rolled_back() {
                    tracing::warn!(target = %job.target_id, %status, "build stack failed");
                    job.finish(BuildOutcome::Failed);
                } else if status.is_being_deleted() {
                    // Someone else is tearing it down; start over.
                    job.reset();
                    *running = running.saturating_sub(1);
                } else {
                    // Stale read; the stack is healthy after all.
                    job.state = JobState::CreateWait;
                }
            }
            JobState::InstanceWait => {
                let Some(ref instance_id) = job.instance_id else {
                    job.reset();
                    *running = running.saturating_sub(1);
                    return Ok(());
                };
                match images.instance_state(instance_id)? {
                    InstanceState::Running => images.stop_instance(instance_id)?,
                    InstanceState::Stopping => {}
                    InstanceState::Stopped => {
                        let image_id = images.create_image(
                            instance_id,
                            &format!("{}-{}", job.launchable_name, job.target_id),
                            &format!(
                                "{} at {}",
                                job.launchable_name,
                                job.candidate
                                    .remaining
                                    .last()
                                    .map(|p| p.name.as_str())
                                    .unwrap_or("")
                            ),
                            &Self::image_tags(job),
                        )?;
                        job.image_id = Some(image_id);
                        job.state = JobState::ImageWait;
                    }
                    state => {
                        tracing::warn!(target = %job.target_id, ?state, "unexpected instance state");
                        job.finish(BuildOutcome::Failed);
                    }
                }
            }
            JobState::ImageWait => {
                let Some(ref image_id) = job.image_id else {
                    job.finish(BuildOutcome::Failed);
                    return Ok(());
                };
                match images.image_state(image_id)? {
                    ImageState::Pending => {}
                    ImageState::Available => {
                        tracing::info!(target = %job.target_id, image = %image_id, "image available");
                        job.finish(BuildOutcome::Ok);
                    }
                    ImageState::Failed => {
                        tracing::warn!(target = %job.target_id, image = %image_id, "image failed");
                        job.image_id = None;
                        job.finish(BuildOutcome::Failed);
                    }
                }
            }
            JobState::Cleanup => {
                // Unconditional: a kept Failed stack would be re-adopted by
                // the next run's discovery and wedge the target forever
                if let Some(ref handle) = job.handle {
                    reconciler.delete(handle)?;
                }
                *running = running.saturating_sub(1);
                job.state = JobState::Done;
            }
            JobState::Done => {}
        }
        if job.state != before {
            tracing::debug!(target = %job.target_id, from = ?before, to = ?job.state, "job transition");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sim::SimCloud;
    use crate::core::resolver::resolve;
    use crate::core::template::BuiltinTemplates;
    use crate::core::types::{status_id, Phase, Purpose, StackStatus};
    use indexmap::IndexMap;

    const REGION: &str = "us-east-1";
    const BASE: &str = "ami-base";

    fn launchable(names: &[&str]) -> Launchable {
        Launchable {
            base_image: IndexMap::from([(REGION.to_string(), BASE.to_string())]),
            buildable: true,
            instance_type: None,
            phases: names.iter().map(|n| Phase::named(n)).collect(),
        }
    }

    fn orchestrator(
        sim: &SimCloud,
        cap: usize,
    ) -> Orchestrator<&SimCloud, &SimCloud, BuiltinTemplates> {
        Orchestrator::new(
            Reconciler::new(sim, "store"),
            ImageStore::new(sim),
            BuiltinTemplates,
            "test",
            cap,
        )
    }

    fn build_candidate(sim: &SimCloud, name: &str, l: &Launchable) -> BuildCandidate {
        let store = ImageStore::new(sim);
        resolve(name, l, REGION, Purpose::Build { next_only: false }, &store)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_st007_single_job_happy_path() {
        let sim = SimCloud::new();
        let l = launchable(&["base", "app"]);
        let candidate = build_candidate(&sim, "web", &l);
        let target = candidate.target_id.clone().unwrap();
        let stack_name = format!("stratus-build-{}", target);

        let mut orch = orchestrator(&sim, 8);
        assert!(orch.enqueue("web", &l, candidate).unwrap());
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();

        assert!(summary.all_ok());
        assert_eq!(summary.reports.len(), 1);
        assert!(summary.reports[0].image_id.is_some());
        assert_eq!(sim.create_calls(&stack_name), 1);
        assert_eq!(sim.delete_calls(&stack_name), 1);

        // The baked image is discoverable under the target's status id
        let found = sim
            .find_images(&Tags::from([
                (TAG_BASE_AMI.to_string(), BASE.to_string()),
                (TAG_STATUS_ID.to_string(), target),
            ]))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_st007_resolution_converges_after_build() {
        let sim = SimCloud::new();
        let l = launchable(&["base", "app"]);
        let candidate = build_candidate(&sim, "web", &l);
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, candidate).unwrap();
        orch.run(&mut Pacer::unthrottled()).unwrap();

        let store = ImageStore::new(&sim);
        // Fully baked now: RUN has no residual phases, BUILD has no targets
        let run = resolve("web", &l, REGION, Purpose::Run, &store).unwrap();
        assert!(run[0].remaining.is_empty());
        let build = resolve("web", &l, REGION, Purpose::Build { next_only: false }, &store)
            .unwrap();
        assert!(build.is_empty());
    }

    #[test]
    fn test_st007_dedup_same_target() {
        let sim = SimCloud::new();
        let l = launchable(&["base", "app"]);
        let mut orch = orchestrator(&sim, 8);
        assert!(orch
            .enqueue("web", &l, build_candidate(&sim, "web", &l))
            .unwrap());
        // Second launchable converging on the same content-addressed target
        assert!(!orch
            .enqueue("worker", &l, build_candidate(&sim, "worker", &l))
            .unwrap());
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();
        assert_eq!(summary.reports.len(), 1);
    }

    #[test]
    fn test_st007_admission_cap_respected() {
        let sim = SimCloud::new().with_poll_delay(3);
        let a = launchable(&["base"]);
        let b = launchable(&["base", "app"]);
        let mut orch = orchestrator(&sim, 1);
        orch.enqueue("a", &a, build_candidate(&sim, "a", &a)).unwrap();
        orch.enqueue("b", &b, build_candidate(&sim, "b", &b)).unwrap();

        let mut pacer = Pacer::unthrottled();
        let mut steps = 0;
        while orch.step_once(&mut pacer).unwrap() {
            assert!(sim.live_stacks() <= 1);
            steps += 1;
            assert!(steps < 200, "jobs did not converge");
        }
        assert_eq!(sim.live_stacks(), 0);
    }

    #[test]
    fn test_st007_blocked_job_waits_without_remote_calls() {
        let sim = SimCloud::new().with_poll_delay(3);
        let a = launchable(&["base"]);
        let b = launchable(&["base", "app"]);
        let mut orch = orchestrator(&sim, 1);
        orch.enqueue("a", &a, build_candidate(&sim, "a", &a)).unwrap();
        orch.enqueue("b", &b, build_candidate(&sim, "b", &b)).unwrap();
        orch.run(&mut Pacer::unthrottled()).unwrap();

        // One discovery pass per job; waiting for a slot polls nothing
        assert_eq!(sim.list_calls(), 2);
    }

    #[test]
    fn test_st007_pacer_paces_each_job_step() {
        let sim = SimCloud::new();
        let a = launchable(&["base"]);
        let b = launchable(&["base", "app"]);
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("a", &a, build_candidate(&sim, "a", &a)).unwrap();
        orch.enqueue("b", &b, build_candidate(&sim, "b", &b)).unwrap();

        let mut pacer = Pacer::new(std::time::Duration::from_millis(20));
        let start = std::time::Instant::now();
        orch.step_once(&mut pacer).unwrap();
        // Two jobs in one sweep: two pauses, so at least one full interval
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
    }

    #[test]
    fn test_st007_resumes_by_adopting_tagged_stack() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        let candidate = build_candidate(&sim, "web", &l);
        let target = candidate.target_id.clone().unwrap();
        let stack_name = format!("stratus-build-{}", target);

        // A previous run already created the stack and crashed
        let mut tags = discovery_tags(BASE, &target);
        tags.insert(TAG_OWNER.to_string(), "test".to_string());
        sim.seed_stack(&stack_name, &tags, StackStatus::Created);

        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, candidate).unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();

        assert!(summary.all_ok());
        assert_eq!(sim.create_calls(&stack_name), 0);
        assert_eq!(sim.delete_calls(&stack_name), 1);
    }

    #[test]
    fn test_st007_rollback_marks_job_failed_and_deletes_stack() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        let candidate = build_candidate(&sim, "web", &l);
        let target = candidate.target_id.clone().unwrap();
        let stack_name = format!("stratus-build-{}", target);
        sim.fail_stack_creation(&stack_name);

        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, candidate).unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();

        assert_eq!(summary.failed(), 1);
        assert!(summary.reports[0].image_id.is_none());
        // Cleanup tears the rolled-back stack down too
        assert_eq!(sim.delete_calls(&stack_name), 1);
        sim.settle();
        let reconciler = Reconciler::new(&sim, "store");
        assert!(reconciler
            .find(&discovery_tags(BASE, &target))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_st007_failed_target_retries_once_cause_is_fixed() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        let candidate = build_candidate(&sim, "web", &l);
        let target = candidate.target_id.clone().unwrap();
        let stack_name = format!("stratus-build-{}", target);
        sim.fail_stack_creation(&stack_name);

        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, candidate).unwrap();
        assert_eq!(orch.run(&mut Pacer::unthrottled()).unwrap().failed(), 1);

        // Cause fixed: a fresh run launches a new stack instead of adopting
        // the dead one, and succeeds
        sim.clear_stack_failure(&stack_name);
        sim.settle();
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, build_candidate(&sim, "web", &l))
            .unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();
        assert!(summary.all_ok());
        assert_eq!(sim.create_calls(&stack_name), 2);
    }

    #[test]
    fn test_st007_failed_job_releases_slot() {
        let sim = SimCloud::new();
        let a = launchable(&["base"]);
        let b = launchable(&["base", "app"]);
        let fail_name = format!(
            "stratus-build-{}",
            status_id(&a.phases)
        );
        sim.fail_stack_creation(&fail_name);

        let mut orch = orchestrator(&sim, 1);
        orch.enqueue("a", &a, build_candidate(&sim, "a", &a)).unwrap();
        orch.enqueue("b", &b, build_candidate(&sim, "b", &b)).unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();

        // The failure frees the single slot so the second target still bakes
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.succeeded(), 1);
    }

    #[test]
    fn test_st007_failed_image_marks_job_failed() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        sim.fail_next_image();
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, build_candidate(&sim, "web", &l))
            .unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();
        assert_eq!(summary.failed(), 1);
        assert!(summary.reports[0].image_id.is_none());
    }

    #[test]
    fn test_st007_terminated_instance_marks_job_failed() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        let candidate = build_candidate(&sim, "web", &l);
        let target = candidate.target_id.clone().unwrap();
        let stack_name = format!("stratus-build-{}", target);

        let mut tags = discovery_tags(BASE, &target);
        tags.insert(TAG_OWNER.to_string(), "test".to_string());
        sim.seed_stack(&stack_name, &tags, StackStatus::Created);
        let instance = sim.describe_stack_resources(&stack_name).unwrap()[0]
            .physical_id
            .clone();
        sim.set_instance_state(&instance, InstanceState::Terminated);

        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, candidate).unwrap();
        let summary = orch.run(&mut Pacer::unthrottled()).unwrap();
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_st007_enqueue_run_candidate_rejected() {
        let sim = SimCloud::new();
        let l = launchable(&["base"]);
        let store = ImageStore::new(&sim);
        let run_candidate = resolve("web", &l, REGION, Purpose::Run, &store)
            .unwrap()
            .remove(0);
        let mut orch = orchestrator(&sim, 8);
        assert!(orch.enqueue("web", &l, run_candidate).is_err());
    }

    #[test]
    fn test_st007_incremental_chain_next_only() {
        let sim = SimCloud::new();
        let l = launchable(&["base", "app"]);
        let store = ImageStore::new(&sim);

        // First increment bakes phases[..1]
        let first = resolve("web", &l, REGION, Purpose::Build { next_only: true }, &store)
            .unwrap()
            .remove(0);
        assert_eq!(first.target_id, Some(status_id(&l.phases[..1])));
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, first).unwrap();
        assert!(orch.run(&mut Pacer::unthrottled()).unwrap().all_ok());

        // Second increment starts from the first image
        let second = resolve("web", &l, REGION, Purpose::Build { next_only: true }, &store)
            .unwrap()
            .remove(0);
        assert_eq!(second.covered.len(), 1);
        assert_eq!(second.target_id, Some(status_id(&l.phases)));
        let mut orch = orchestrator(&sim, 8);
        orch.enqueue("web", &l, second).unwrap();
        assert!(orch.run(&mut Pacer::unthrottled()).unwrap().all_ok());
    }
}
