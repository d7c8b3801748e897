//! Boot device sequencer
//!
//! Tries boot candidates strictly in the order supplied. For each one:
//! open, probe, detect, parse, verify, plan. The first stage to fail
//! abandons the candidate (one trace entry, handle closed) and the next
//! candidate is tried; nothing learned from an abandoned candidate is
//! carried forward.
//!
//! The sequencer is resumable: when loading a returned plan fails, calling
//! [`BootSequencer::run`] again continues with the following candidate.
//! When every candidate is exhausted and the policy opts in with
//! `allow_fallback_unverified`, the first candidate that failed only
//! verification is reopened and accepted without verification.

use stageboot_api::{
    BootDeviceCandidate, Decompressor, Liveness, MediaAccess, TargetMemory, TrustAnchor,
};

use super::boot_config::{BootConfig, BootPolicy, VerificationLevel};
use super::stage_context::StageContext;
use crate::diagnostics::boot_trace::{BootTrace, PipelineStage};
use crate::error::{BootError, BootFailure, LoadError};
use crate::firmware::MediaReader;
use crate::kernel_if::load_plan::LoadPlan;
use crate::kernel_if::loader::StageLoader;
use crate::protocol::{self, classify, ParseContext, ProbeBuffer};
use crate::security::verifier::{verify, TrustPolicy, VerificationResult};

/// Candidate whose plan was handed out and whose media is still open
struct Selected<H> {
    index: usize,
    candidate: BootDeviceCandidate,
    handle: H,
}

pub struct BootSequencer<'a, M: MediaAccess, T: TrustAnchor + ?Sized> {
    media: &'a mut M,
    trust: &'a T,
    liveness: &'a mut dyn Liveness,
    config: &'a BootConfig,
    ctx: StageContext,
    trace: BootTrace,
    /// Next candidate index to try
    next: usize,
    /// Candidates tried so far, counted against `max_candidates`
    tried: usize,
    /// First candidate abandoned only for failing verification
    unverified: Option<usize>,
    selected: Option<Selected<M::Handle>>,
}

impl<'a, M: MediaAccess, T: TrustAnchor + ?Sized> BootSequencer<'a, M, T> {
    pub fn new(
        media: &'a mut M,
        trust: &'a T,
        liveness: &'a mut dyn Liveness,
        config: &'a BootConfig,
        ctx: StageContext,
    ) -> Self {
        Self {
            media,
            trust,
            liveness,
            config,
            ctx,
            trace: BootTrace::new(),
            next: 0,
            tried: 0,
            unverified: None,
            selected: None,
        }
    }

    pub fn trace(&self) -> &BootTrace {
        &self.trace
    }

    /// Find the next candidate that parses, verifies and plans cleanly.
    ///
    /// The returned plan's medium stays open until [`Self::load`].
    pub fn run(
        &mut self,
        candidates: &[BootDeviceCandidate],
        policy: &BootPolicy,
    ) -> Result<LoadPlan, BootFailure> {
        self.release();

        while self.next < candidates.len() {
            if policy.max_candidates != 0 && self.tried >= policy.max_candidates {
                log::info!("candidate limit {} reached", policy.max_candidates);
                break;
            }
            let index = self.next;
            self.next += 1;
            self.tried += 1;
            let candidate = candidates[index];
            log::info!("trying {}", candidate);

            match self.attempt(index, candidate, Some(policy)) {
                Ok(plan) => return Ok(plan),
                Err((stage, error)) => {
                    if stage == PipelineStage::Verify && self.unverified.is_none() {
                        self.unverified = Some(index);
                    }
                    self.trace.record(candidate, stage, error);
                }
            }
        }

        if policy.allow_fallback_unverified {
            if let Some(index) = self.unverified.take() {
                let candidate = candidates[index];
                log::warn!("{}: accepting without verification (fallback)", candidate);
                match self.attempt(index, candidate, None) {
                    Ok(mut plan) => {
                        plan.unverified = true;
                        return Ok(plan);
                    }
                    Err((stage, error)) => self.trace.record(candidate, stage, error),
                }
            }
        }

        Err(BootError::NoBootableMedia)
    }

    /// Copy the plan last returned by [`Self::run`] into target memory.
    ///
    /// The medium is closed afterwards either way; on failure the candidate
    /// is recorded as abandoned and `run` may be called again.
    pub fn load(
        &mut self,
        plan: &LoadPlan,
        memory: &mut dyn TargetMemory,
        codec: &mut dyn Decompressor,
    ) -> Result<(), LoadError> {
        let Some(mut selected) = self.selected.take() else {
            return Err(LoadError::Io(stageboot_api::IoError::NotPresent));
        };
        let result = {
            let mut reader =
                MediaReader::new(&mut *self.media, &mut selected.handle, selected.candidate.offset);
            let mut loader = StageLoader::new(
                memory,
                codec,
                &mut *self.liveness,
                self.config.liveness_chunk,
            );
            loader.apply(plan, &mut reader)
        };
        self.media.close(selected.handle);
        if let Err(e) = result {
            if self.unverified == Some(selected.index) {
                self.unverified = None;
            }
            self.trace
                .record(selected.candidate, PipelineStage::Load, BootError::Load(e));
        }
        result
    }

    /// Close a medium left open by an unloaded plan
    fn release(&mut self) {
        if let Some(selected) = self.selected.take() {
            self.media.close(selected.handle);
        }
    }

    fn attempt(
        &mut self,
        index: usize,
        candidate: BootDeviceCandidate,
        policy: Option<&BootPolicy>,
    ) -> Result<LoadPlan, (PipelineStage, BootError)> {
        let mut handle = self
            .media
            .open(&candidate)
            .map_err(|e| (PipelineStage::Open, BootError::MediaOpen(e)))?;

        let result = {
            let mut reader = MediaReader::new(&mut *self.media, &mut handle, candidate.offset);
            let trust = policy.map(|p| TrustPolicy::new(p, self.trust, self.config.liveness_chunk));
            inspect(
                &mut reader,
                candidate,
                self.config,
                &self.ctx,
                trust.as_ref(),
                &mut *self.liveness,
            )
        };

        match result {
            Ok(plan) => {
                self.selected = Some(Selected {
                    index,
                    candidate,
                    handle,
                });
                Ok(plan)
            }
            Err(e) => {
                self.media.close(handle);
                Err(e)
            }
        }
    }
}

impl<'a, M: MediaAccess, T: TrustAnchor + ?Sized> Drop for BootSequencer<'a, M, T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Probe, detect, parse, verify (unless `trust` is `None`) and plan one
/// opened candidate.
fn inspect<M, T>(
    reader: &mut MediaReader<'_, M>,
    candidate: BootDeviceCandidate,
    config: &BootConfig,
    ctx: &StageContext,
    trust: Option<&TrustPolicy<'_, T>>,
    liveness: &mut dyn Liveness,
) -> Result<LoadPlan, (PipelineStage, BootError)>
where
    M: MediaAccess,
    T: TrustAnchor + ?Sized,
{
    let probe = ProbeBuffer::read(reader, config.probe_size)
        .map_err(|e| (PipelineStage::Probe, BootError::MediaIo(e)))?;
    let format =
        classify(&probe).ok_or((PipelineStage::Detect, BootError::FormatUnrecognized))?;
    log::debug!("{}: {}", candidate, format);

    let parse_ctx = ParseContext {
        limits: &config.limits,
        arch: config.arch,
        configuration: config.fit_configuration.as_deref(),
    };
    let descriptor = protocol::parse(format, reader, &parse_ctx)
        .map_err(|e| (PipelineStage::Parse, BootError::from(e)))?;

    let level = match trust {
        Some(trust) => match verify(&descriptor, reader, trust, liveness) {
            VerificationResult::Pass(level) => level,
            VerificationResult::Fail(failure) => {
                return Err((PipelineStage::Verify, BootError::VerificationFailed(failure)))
            }
        },
        None => VerificationLevel::None,
    };

    LoadPlan::build(candidate, &descriptor, config, ctx, level)
        .map_err(|e| (PipelineStage::Plan, BootError::PlanInvalid(e)))
}
