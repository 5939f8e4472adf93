//! `Bgpipe`: turns parsed [`GlobalOpts`] into a running pipeline. Owns
//! argv→stage resolution (`argv`), direction assignment, wait-group
//! bookkeeping (`waitgroup`), and the per-stage Run wrapper state machine
//! that drives every stage through build -> prepare -> spawn -> join.

pub mod argv;
pub mod errors;
pub mod waitgroup;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::FutureExt;

use crate::config::{GlobalOpts, StageConfig, StdioMode};
use crate::core::message::{Side, StartAt};
use crate::core::pipeline::Pipeline;
use crate::stage::base::{CancelToken, Capabilities, StageBase};
use crate::stage::{factory, Stage};
use argv::{parse_stage_flags, tokenize_stages, RawStage};
use errors::BgpipeError;
use waitgroup::WaitGroups;

/// Which of the four wait groups a prepared stage participates in, derived
/// once from its assigned side × static capabilities.
#[derive(Debug, Clone, Copy, Default)]
struct WgContribution {
    l_read: bool,
    l_write: bool,
    r_read: bool,
    r_write: bool,
}

impl WgContribution {
    fn for_stage(is_left: bool, is_right: bool, is_producer: bool, is_consumer: bool) -> Self {
        Self {
            l_write: is_left && is_producer,
            l_read: is_left && is_consumer,
            r_write: is_right && is_producer,
            r_read: is_right && is_consumer,
        }
    }
}

/// Default `(is_left, is_right)` for a stage with neither `-L` nor `-R` set
/// explicitly: last stage faces L, every other position faces R, except a
/// last-position stage that both produces and consumes (a live peer
/// endpoint like tcp/listen/speaker/exec) faces the opposite side, R,
/// instead, and a first-position stage that doesn't produce anything (a
/// pure sink) faces L. A last-position stage that only produces, with no
/// consumer side (a file source like mrt landing in the last slot, which
/// only happens via `--reverse`), isn't a peer and keeps the plain
/// "last stage -> L" default.
fn default_direction(is_first: bool, is_last: bool, is_producer: bool, is_consumer: bool) -> (bool, bool) {
    if is_last && is_producer && is_consumer {
        (false, true)
    } else if is_first && !is_producer {
        (true, false)
    } else if is_last {
        (true, false)
    } else {
        (false, true)
    }
}

/// A stage whose direction genuinely represents a protocol endpoint: it
/// either owns a raw byte stream outright (`tcp`/`listen`/`mrt`) or behaves
/// as a full-duplex peer (`speaker`/`exec`). Everything else — `stdin`,
/// `stdout` — is a pure adapter with no direction of its own; it only
/// matters which anchor's stream it feeds or drains.
fn is_anchor(caps: &Capabilities) -> bool {
    caps.is_raw_reader || caps.is_raw_writer || (caps.is_producer && caps.is_consumer)
}

/// Resolves every stage's `(is_left, is_right)` from its position in the
/// pipeline's actual producer/consumer graph, not from stage position in
/// isolation: an anchor without explicit `-L`/`-R` gets the positional
/// default from [`default_direction`]; a non-anchor adapter inherits the
/// nearest resolved anchor's side (ties broken toward the lower index),
/// since e.g. `stdout` or an auto-inserted `stdin` needs to sit on whatever
/// side the real traffic already flows on rather than picking one by its
/// own position — a plain `mrt` file followed only by an auto `stdout`
/// would otherwise default to opposite sides and nothing would ever reach
/// the sink. A pipeline with no anchor at all (only stdio stages) falls
/// back to R for every stage, so they still agree.
fn resolve_directions(explicit: &[(bool, bool)], caps: &[Capabilities]) -> Vec<(bool, bool)> {
    let n = caps.len();
    let mut resolved: Vec<Option<(bool, bool)>> = vec![None; n];

    for i in 0..n {
        let (has_l, has_r) = explicit[i];
        if has_l || has_r {
            resolved[i] = Some((has_l, has_r));
        } else if is_anchor(&caps[i]) {
            let is_first = i == 0;
            let is_last = i == n - 1;
            resolved[i] = Some(default_direction(is_first, is_last, caps[i].is_producer, caps[i].is_consumer));
        }
    }

    for i in 0..n {
        if resolved[i].is_some() {
            continue;
        }
        let nearest = (0..n).filter(|&j| resolved[j].is_some()).min_by_key(|&j| (j.abs_diff(i), j));
        resolved[i] = Some(nearest.and_then(|j| resolved[j]).unwrap_or((false, true)));
    }

    resolved.into_iter().map(|r| r.unwrap()).collect()
}

/// Resolves a `--name`/`@name` or `here`/`first`/`last`/`after` `in=` value
/// into a [`StartAt`].
fn resolve_start_at(raw: &str, own_index: usize, is_left: bool, names: &HashMap<String, usize>) -> Result<StartAt> {
    match raw {
        "first" => Ok(StartAt::First),
        "last" => Ok(StartAt::SkipAll),
        "here" => Ok(StartAt::At(own_index)),
        "after" => {
            let neighbour = if is_left {
                own_index.checked_sub(1)
            } else {
                Some(own_index + 1)
            };
            Ok(neighbour.map(StartAt::At).unwrap_or(StartAt::First))
        }
        name => {
            let target = name.strip_prefix('@').unwrap_or(name);
            names
                .get(target)
                .map(|&idx| StartAt::At(idx))
                .ok_or_else(|| BgpipeError::InjectionTarget(raw.to_string()).into())
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One resolved stage, ready to run: the boxed implementation plus its
/// wait-group participation, computed once at build time.
struct StageEntry {
    stage: Box<dyn Stage>,
    wg: WgContribution,
}

/// The running pipeline's controller: builds the stage list from argv,
/// prepares every stage, then drives them to completion.
pub struct Bgpipe {
    pipeline: Arc<Pipeline>,
    stages: Vec<StageEntry>,
    wait_groups: Arc<WaitGroups>,
    root_cancel: CancelToken,
}

impl Bgpipe {
    /// Parses `opts.stages` into a stage list, assigns directions, wires
    /// wait/stop events, and runs every stage's `prepare()`. Stages are
    /// not yet running; call [`Bgpipe::run`] to start the pipeline.
    pub async fn build(opts: &GlobalOpts) -> Result<Self> {
        let mut raw_stages = tokenize_stages(&opts.stages, factory::KNOWN_COMMANDS)?;
        if raw_stages.is_empty() {
            anyhow::bail!("bgpipe needs at least one stage");
        }

        let has_stdin = raw_stages.iter().any(|r| r.command == "stdin");
        let has_stdout = raw_stages.iter().any(|r| r.command == "stdout");
        match opts.stdio {
            StdioMode::None => {}
            StdioMode::In => {
                if !has_stdin {
                    raw_stages.insert(0, RawStage { command: "stdin".into(), args: Vec::new() });
                }
            }
            StdioMode::Out => {
                if !has_stdout && !opts.quiet {
                    raw_stages.push(RawStage { command: "stdout".into(), args: Vec::new() });
                }
            }
            StdioMode::Auto => {
                if !has_stdout && !opts.quiet {
                    raw_stages.push(RawStage { command: "stdout".into(), args: Vec::new() });
                }
                if !has_stdin {
                    raw_stages.insert(
                        0,
                        RawStage {
                            command: "stdin".into(),
                            args: vec!["--in".into(), "first".into(), "--wait".into(), "ESTABLISHED".into()],
                        },
                    );
                }
            }
        }

        let mut configs: Vec<StageConfig> = raw_stages.iter().map(parse_stage_flags).collect();

        if opts.no_parse_error {
            // Global `-E`/`--no-parse-error` is equivalent to every Extio-backed
            // stage's own `pardon` flag; a stage's explicit `pardon` (or
            // `no-pardon`, if it ever sets one) still takes precedence.
            for cfg in configs.iter_mut() {
                cfg.flags.entry("pardon".to_string()).or_insert_with(String::new);
            }
        }

        if opts.reverse {
            configs.reverse();
            for cfg in configs.iter_mut() {
                let had_l = cfg.flags.remove("L");
                let had_r = cfg.flags.remove("R");
                if had_l.is_some() {
                    cfg.flags.insert("R".to_string(), String::new());
                } else if had_r.is_some() {
                    cfg.flags.insert("L".to_string(), String::new());
                }
            }
        }

        let n = configs.len();
        let root_cancel = CancelToken::new();
        let pipeline = Arc::new(Pipeline::new());
        let wait_groups = Arc::new(WaitGroups::new());

        if opts.short_asn {
            pipeline.capabilities.lock().unwrap().four_byte_asn = false;
        }

        // Pass 1: build every StageBase with its direction resolved, check
        // invariants that only need static capabilities, and record names.
        let static_caps: Vec<Capabilities> = configs.iter().map(|c| factory::static_capabilities(&c.command)).collect();
        let explicit: Vec<(bool, bool)> = configs
            .iter()
            .map(|c| (c.flags.contains_key("L"), c.flags.contains_key("R")))
            .collect();
        let directions = resolve_directions(&explicit, &static_caps);

        let mut bases = Vec::with_capacity(n);
        let mut names = HashMap::new();
        for (i, cfg) in configs.into_iter().enumerate() {
            let index = i + 1;
            let is_first = index == 1;
            let is_last = index == n;
            let (is_left, is_right) = directions[i];

            let mut base = factory::new_stage_base(index, cfg.command.clone(), cfg, &root_cancel);
            base.is_left = is_left;
            base.is_right = is_right;
            base.is_first = is_first;
            base.is_last = is_last;
            base.check_lr_invariant()?;
            base.check_raw_endpoint_invariant()?;

            if names.insert(base.name.clone(), index).is_some() {
                return Err(BgpipeError::StageDuplicate(base.name.clone()).into());
            }

            bases.push(base);
        }

        // Pass 2: resolve `in=`/`wait=`/`stop=` now that every name is known,
        // register the enable/disable event handlers, then run prepare().
        let mut stages = Vec::with_capacity(n);
        for mut base in bases {
            if let Some(raw_in) = base.config.flags.get("in").cloned() {
                base.start_at = resolve_start_at(&raw_in, base.index, base.is_left, &names)?;
            }
            base.wait_events = base
                .config
                .flags
                .get("wait")
                .map(|s| split_csv(s))
                .unwrap_or_default();
            base.stop_events = base
                .config
                .flags
                .get("stop")
                .map(|s| split_csv(s))
                .unwrap_or_default();

            register_enable_handler(&pipeline, &base);
            register_stop_handler(&pipeline, &base);

            let is_producer = base.caps.is_producer;
            let is_consumer = base.caps.is_consumer;
            let is_left = base.is_left;
            let is_right = base.is_right;

            let mut stage = factory::build_stage(base)?;
            stage.prepare(&pipeline).await?;

            // Participation is computed now (it only depends on static
            // assignment), but the wait groups themselves aren't incremented
            // until `run_stage` confirms the stage is actually about to run
            // — see the comment there.
            let wg = WgContribution::for_stage(is_left, is_right, is_producer, is_consumer);
            stages.push(StageEntry { stage, wg });
        }

        for name in &opts.events {
            register_trace_handler(&pipeline, name);
        }

        Ok(Self {
            pipeline,
            stages,
            wait_groups,
            root_cancel,
        })
    }

    /// Starts the pipeline's dispatch loops, launches every stage's Run
    /// wrapper, installs a SIGINT handler that cancels the root token, and
    /// blocks until both directions have drained and every stage has
    /// returned.
    pub async fn run(mut self) -> Result<()> {
        self.pipeline.start();

        let sigint_cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, cancelling pipeline");
                sigint_cancel.cancel(anyhow!("SIGINT"));
            }
        });

        let mut handles = Vec::with_capacity(self.stages.len());
        let mut stage_cancels = Vec::with_capacity(self.stages.len());
        for entry in std::mem::take(&mut self.stages) {
            stage_cancels.push(entry.stage.stage_base().cancel.clone());
            let pipeline = self.pipeline.clone();
            let root = self.root_cancel.clone();
            let wait_groups = self.wait_groups.clone();
            handles.push(tokio::spawn(run_stage(entry.stage, entry.wg, pipeline, wait_groups, root)));
        }

        self.pipeline.wait().await;

        // Both directions have now fully drained, which only happens once
        // every stage that actually started has already decremented its
        // wait-group contribution. Anything still alive at this point is a
        // stage that never started (still blocked on a `wait=` trigger that
        // will now never fire) or one with no natural EOF of its own (e.g.
        // `stdout`, looping on its Extio channel). Cancel each stage's own
        // token — not root — so those wind down without marking the run as
        // failed.
        for cancel in &stage_cancels {
            cancel.cancel(anyhow!("pipeline drained"));
        }

        for h in handles {
            let _ = h.await;
        }

        if let Some(cause) = self.root_cancel.cause() {
            return Err(anyhow!("{cause}"));
        }
        Ok(())
    }
}

/// Registers the handler that flips a stage `enabled` once its configured
/// wait condition fires: `pipe.START` when `wait_events` is empty, or every
/// named event in `wait_events` otherwise (first one wins).
fn register_enable_handler(pipeline: &Arc<Pipeline>, base: &StageBase) {
    use crate::core::event::HandlerPhase;

    let enabled = base.enabled.clone();
    let notify = base.enable_notify.clone();
    let names = if base.wait_events.is_empty() {
        vec!["START".to_string()]
    } else {
        base.wait_events.clone()
    };
    pipeline.on_event(
        names,
        HandlerPhase::Pre,
        0,
        true,
        Arc::new(move |_name, _msg, _args| {
            enabled.store(true, std::sync::atomic::Ordering::Release);
            notify.notify_waiters();
            true
        }),
    );
}

/// Registers the handler that cancels a stage's own token (not the root)
/// when one of its `stop_events` fires.
fn register_stop_handler(pipeline: &Arc<Pipeline>, base: &StageBase) {
    use crate::core::event::HandlerPhase;

    if base.stop_events.is_empty() {
        return;
    }
    let cancel = base.cancel.clone();
    let name = base.name.clone();
    pipeline.on_event(
        base.stop_events.clone(),
        HandlerPhase::Post,
        0,
        false,
        Arc::new(move |event_name, _msg, _args| {
            tracing::info!(stage = %name, event = %event_name, "stop event fired, cancelling stage");
            cancel.cancel(anyhow!("stop event '{event_name}'"));
            true
        }),
    );
}

/// Registers a `--events` tracer: a lowest-order pre-phase handler that logs
/// every occurrence of `name`.
fn register_trace_handler(pipeline: &Arc<Pipeline>, name: &str) {
    use crate::core::event::HandlerPhase;
    let name = name.to_string();
    pipeline.on_event(
        vec![name.clone()],
        HandlerPhase::Pre,
        i64::MIN,
        false,
        Arc::new(move |canonical, _msg, args| {
            tracing::info!(event = %canonical, args = ?args, "event");
            true
        }),
    );
}

/// The per-stage Run wrapper: waits for `enabled` (or gives up if the stage
/// is cancelled first), CASes `started` to prevent a double-run, increments
/// this stage's wait-group participation only once it is actually about to
/// run, launches `Stage::run` with panics caught, normalises the
/// `StageStopped` sentinel into a clean exit, cancels the root on any other
/// error, gives the stage up to one second to return after cancellation
/// before giving up on it, then always calls `Stage::stop` and closes
/// whichever wait groups this stage contributed to.
async fn run_stage(
    mut stage: Box<dyn Stage>,
    wg: WgContribution,
    pipeline: Arc<Pipeline>,
    wait_groups: Arc<WaitGroups>,
    root: CancelToken,
) {
    let name = stage.stage_base().name.clone();
    let index = stage.stage_base().index;

    if !stage.stage_base().wait_enabled().await {
        tracing::info!(stage = %name, index, "stage cancelled before its wait condition fired, skipping run");
        if let Err(e) = stage.stop().await {
            tracing::warn!(stage = %name, index, error = %e, "stage stop() failed");
        }
        stage.stage_base().stopped.store(true, std::sync::atomic::Ordering::Release);
        return;
    }

    if stage.stage_base().started.swap(true, std::sync::atomic::Ordering::AcqRel) {
        return;
    }

    // Only now, right before the stage actually runs, does it begin
    // contributing to wait-group accounting. A stage that never becomes
    // enabled — e.g. an auto-inserted `stdin` waiting on an `ESTABLISHED`
    // that never fires in a pipeline with no `speaker` — must never hold a
    // wait group open, since that would keep the direction it would have
    // participated in from ever closing.
    if wg.l_write {
        wait_groups.l_write.add(1);
    }
    if wg.l_read {
        wait_groups.l_read.add(1);
    }
    if wg.r_write {
        wait_groups.r_write.add(1);
    }
    if wg.r_read {
        wait_groups.r_read.add(1);
    }

    let cancel = stage.stage_base().cancel.clone();

    let mut run_fut = Box::pin(std::panic::AssertUnwindSafe(stage.run(&pipeline)).catch_unwind());

    let outcome = tokio::select! {
        res = &mut run_fut => res,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(Duration::from_secs(1), &mut run_fut).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(stage = %name, index, "stage did not stop within 1s of cancellation, forcing resource release");
                    Ok(Err(BgpipeError::StageStopped.into()))
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => {
            tracing::debug!(stage = %name, index, "stage exited cleanly");
        }
        Ok(Err(e)) => {
            if e.downcast_ref::<BgpipeError>().is_some_and(|be| matches!(be, BgpipeError::StageStopped)) {
                tracing::info!(stage = %name, index, "stage stopped");
            } else if root.is_cancelled() {
                tracing::info!(stage = %name, index, error = %e, "stage exited after cancellation");
            } else {
                tracing::error!(stage = %name, index, error = %e, "stage failed, cancelling pipeline");
                root.cancel(anyhow!("stage '{name}' (index {index}) failed: {e}"));
            }
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(stage = %name, index, panic = %msg, "stage panicked, cancelling pipeline");
            root.cancel(anyhow!("stage '{name}' (index {index}) panicked: {msg}"));
        }
    }

    if let Err(e) = stage.stop().await {
        tracing::warn!(stage = %name, index, error = %e, "stage stop() failed");
    }
    stage.stage_base().stopped.store(true, std::sync::atomic::Ordering::Release);

    // Zero-crossing on a write group means no producer remains for that
    // side, so its input is closed; zero-crossing on a read group means no
    // consumer remains, so its output is closed.
    if wg.l_write && wait_groups.l_write.done() {
        pipeline.direction(Side::L).close_input();
    }
    if wg.l_read && wait_groups.l_read.done() {
        pipeline.direction(Side::L).close_output();
    }
    if wg.r_write && wait_groups.r_write.done() {
        pipeline.direction(Side::R).close_input();
    }
    if wg.r_read && wait_groups.r_read.done() {
        pipeline.direction(Side::R).close_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_direction_last_stage_sink_faces_l() {
        // stdout: not producer, is consumer, last position.
        assert_eq!(default_direction(false, true, false, true), (true, false));
    }

    #[test]
    fn default_direction_middle_stage_faces_r() {
        assert_eq!(default_direction(false, false, true, true), (false, true));
    }

    #[test]
    fn default_direction_first_stage_producer_faces_r() {
        // tcp first in a pipeline, non-last: general "otherwise R" default.
        assert_eq!(default_direction(true, false, true, true), (false, true));
    }

    #[test]
    fn default_direction_last_peer_endpoint_faces_r() {
        // speaker/tcp/exec/listen as the last stage: producer+consumer peer.
        assert_eq!(default_direction(false, true, true, true), (false, true));
    }

    fn test_opts(stages: Vec<&str>) -> GlobalOpts {
        GlobalOpts {
            log: "error".to_string(),
            stdio: StdioMode::None,
            reverse: false,
            quiet: true,
            no_parse_error: false,
            short_asn: false,
            events: Vec::new(),
            stages: stages.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn global_no_parse_error_sets_pardon_on_every_stage() {
        let mut opts = test_opts(vec!["stdin", "--", "stdout"]);
        opts.no_parse_error = true;
        let bgpipe = Bgpipe::build(&opts).await.unwrap();
        assert!(bgpipe
            .stages
            .iter()
            .all(|e| e.stage.stage_base().config.flags.contains_key("pardon")));
    }

    #[tokio::test]
    async fn global_no_parse_error_does_not_override_explicit_pardon_false() {
        // stdin's own explicit `--pardon=false` must win over the global
        // propagation, since per-stage config always takes precedence.
        let mut opts = test_opts(vec!["stdin", "--pardon=false", "--", "stdout"]);
        opts.no_parse_error = true;
        let bgpipe = Bgpipe::build(&opts).await.unwrap();
        let stdin_entry = &bgpipe.stages[0];
        assert_eq!(
            stdin_entry.stage.stage_base().config.flags.get("pardon").map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn resolve_directions_mrt_with_auto_stdio_all_match() {
        // `./dump.mrt.gz` under the default `StdioMode::Auto` splices to
        // [stdin(auto), mrt, stdout(auto)]; mrt is the pipeline's only
        // anchor, so both stdio adapters must inherit its side or mrt's
        // output can never reach stdout.
        let caps = vec![
            factory::static_capabilities("stdin"),
            factory::static_capabilities("mrt"),
            factory::static_capabilities("stdout"),
        ];
        let explicit = vec![(false, false); 3];
        let dirs = resolve_directions(&explicit, &caps);
        assert_eq!(dirs[0], dirs[1], "auto-stdin must match mrt's side");
        assert_eq!(dirs[1], dirs[2], "mrt and stdout must share a side");
    }

    #[test]
    fn resolve_directions_tee_through_all_match() {
        let caps = vec![
            factory::static_capabilities("tcp"),
            factory::static_capabilities("exec"),
            factory::static_capabilities("stdout"),
        ];
        let explicit = vec![(false, false); 3];
        let dirs = resolve_directions(&explicit, &caps);
        assert_eq!(dirs[0], dirs[1]);
        assert_eq!(dirs[1], dirs[2]);
    }

    #[test]
    fn resolve_directions_explicit_flag_wins_over_anchor_inheritance() {
        let caps = vec![factory::static_capabilities("mrt"), factory::static_capabilities("stdout")];
        let explicit = vec![(false, false), (true, false)];
        let dirs = resolve_directions(&explicit, &caps);
        assert_eq!(dirs[1], (true, false), "explicit -L must override nearest-anchor inheritance");
    }

    #[test]
    fn resolve_directions_no_anchor_defaults_every_stage_to_r() {
        let caps = vec![factory::static_capabilities("stdin"), factory::static_capabilities("stdout")];
        let explicit = vec![(false, false); 2];
        let dirs = resolve_directions(&explicit, &caps);
        assert_eq!(dirs, vec![(false, true), (false, true)]);
    }

    struct NeverRunStage {
        base: StageBase,
    }

    #[async_trait::async_trait]
    impl Stage for NeverRunStage {
        fn stage_base(&self) -> &StageBase {
            &self.base
        }

        fn stage_base_mut(&mut self) -> &mut StageBase {
            &mut self.base
        }

        async fn prepare(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
            Ok(())
        }

        async fn run(&mut self, _pipeline: &Arc<Pipeline>) -> Result<()> {
            panic!("run() must never be called for a stage cancelled before it became enabled");
        }
    }

    #[tokio::test]
    async fn run_stage_skips_run_and_wait_groups_when_cancelled_before_enabled() {
        let root = CancelToken::new();
        let base = factory::new_stage_base(1, "stdin".to_string(), StageConfig::new("stdin"), &root);
        let cancel = base.cancel.clone();
        let stage: Box<dyn Stage> = Box::new(NeverRunStage { base });
        let pipeline = Arc::new(Pipeline::new());
        let wait_groups = Arc::new(WaitGroups::new());
        let wg = WgContribution {
            l_read: false,
            l_write: false,
            r_read: false,
            r_write: true,
        };

        // Mimic the controller giving up on this stage before its `wait=`
        // trigger ever fires (e.g. once the rest of the pipeline has drained).
        cancel.cancel(anyhow!("test: giving up on stage"));

        tokio::time::timeout(Duration::from_millis(200), run_stage(stage, wg, pipeline, wait_groups.clone(), root))
            .await
            .expect("run_stage must return promptly, not hang in wait_enabled");

        assert_eq!(
            wait_groups.r_write.get(),
            0,
            "a stage that never ran must never hold a wait group open"
        );
    }

    /// `mrt f.mrt speaker` with `--reverse` becomes `speaker mrt f.mrt`:
    /// speaker (now first, producer+consumer) defaults to R, mrt (now
    /// last, producer-only) defaults to L rather than the live-peer "last
    /// stage producer -> R" exception, since it has no consumer side.
    #[test]
    fn reversed_mrt_speaker_matches_worked_example() {
        let speaker_caps = factory::static_capabilities("speaker");
        let mrt_caps = factory::static_capabilities("mrt");

        let speaker_dir = default_direction(true, false, speaker_caps.is_producer, speaker_caps.is_consumer);
        let mrt_dir = default_direction(false, true, mrt_caps.is_producer, mrt_caps.is_consumer);

        assert_eq!(speaker_dir, (false, true), "speaker (now first) should default to R");
        assert_eq!(mrt_dir, (true, false), "mrt (now last) should default to L");
    }
}
