//! The public entry points: stepping, walking, scope lookup and exception
//! dispatch for whatever a [`FunctionTable`] knows about.
//!
//! Every failure is returned to the caller and also recorded in the
//! caller's [`Diagnostics`]. A lookup miss is not a failure, the frame is
//! stepped as a leaf instead.


use alloc::{vec, vec::Vec};

use tracing::Level;

use crate::{
    descriptor::UnwindDescriptor,
    diag::Diagnostics,
    dispatch::{self, Dispatched, HandlerInvoker},
    error::{Result, UnwindError},
    leaf::step_leaf,
    memory::Memory,
    scope::{self, ScopeMatch},
    snapshot::RegisterSnapshot,
    step::{Backend, FrameStepper, StepperConfig, VirtualUnwind},
    table::{FunctionEntry, FunctionTable},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkConfig {
    /// Frames collected before a walk gives up, the starting frame included.
    pub max_frames: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self { max_frames: 256 }
    }
}

/// One frame stepped out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub caller: RegisterSnapshot,
    /// The function that was stepped out of, `None` for a leaf frame.
    pub function: Option<FunctionEntry>,
    pub backend: Option<Backend>,
    pub handler: Option<u64>,
    pub scope: Option<ScopeMatch>,
}

impl Step {
    pub fn is_leaf(&self) -> bool {
        self.function.is_none()
    }
}

/// Why a walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    /// A step produced a null instruction or stack pointer.
    Sentinel,
    /// A frame other than the first has no unwind information.
    LookupMiss,
    FrameLimit,
    Failed(UnwindError),
}

/// Everything a walk found. On failure `frames` still holds every frame
/// resolved before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    /// The starting snapshot followed by one snapshot per caller.
    pub frames: Vec<RegisterSnapshot>,
    /// Successful steps, including the one that reached a sentinel.
    pub steps: usize,
    pub end: WalkEnd,
}

impl Walk {
    pub fn is_complete(&self) -> bool {
        matches!(self.end, WalkEnd::Sentinel | WalkEnd::LookupMiss)
    }
}

/// What an exception observer should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// Resume execution with these registers.
    Resume(RegisterSnapshot),
    /// Let the next observer have it.
    Defer,
}

pub struct Unwinder<'a, M: ?Sized, T: ?Sized> {
    memory: &'a M,
    table: &'a T,
    platform: Option<&'a dyn VirtualUnwind>,
    stepper: StepperConfig,
    walk: WalkConfig,
}

impl<'a, M, T> Unwinder<'a, M, T>
where
    M: Memory + ?Sized,
    T: FunctionTable + ?Sized,
{
    pub fn new(memory: &'a M, table: &'a T) -> Self {
        Self {
            memory,
            table,
            platform: None,
            stepper: StepperConfig::default(),
            walk: WalkConfig::default(),
        }
    }

    pub fn with_platform(mut self, platform: &'a dyn VirtualUnwind) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_stepper_config(mut self, config: StepperConfig) -> Self {
        self.stepper = config;
        self
    }

    pub fn with_walk_config(mut self, config: WalkConfig) -> Self {
        self.walk = config;
        self
    }

    fn stepper(&self) -> FrameStepper<'a, M> {
        let stepper = FrameStepper::new(self.memory, self.stepper);
        match self.platform {
            Some(platform) => stepper.with_platform(platform),
            None => stepper,
        }
    }

    fn locate(&self, ip: u64) -> Result<Option<(FunctionEntry, UnwindDescriptor)>> {
        let Some(entry) = self.table.lookup(ip) else {
            return Ok(None);
        };
        let descriptor = UnwindDescriptor::load(self.memory, entry.descriptor_address())?;
        Ok(Some((entry, descriptor)))
    }

    /// Steps from `snapshot` to its caller.
    pub fn step_one_frame(&self, snapshot: &RegisterSnapshot, diag: &mut Diagnostics) -> Result<Step> {
        let result = self.step_inner(snapshot, diag);
        if let Err(err) = &result {
            diag.record(err);
        }
        result
    }

    fn step_inner(&self, snapshot: &RegisterSnapshot, diag: &mut Diagnostics) -> Result<Step> {
        let Some((entry, descriptor)) = self.locate(snapshot.ip)? else {
            diag.log(
                Level::DEBUG,
                format_args!("no unwind info for {:#x}, stepping as a leaf", snapshot.ip),
            );
            let caller = step_leaf(self.memory, snapshot)?;
            return Ok(Step {
                caller,
                function: None,
                backend: None,
                handler: None,
                scope: None,
            });
        };

        let stepped = self.stepper().step(&entry, &descriptor, snapshot)?;
        let scope = match stepped.scope {
            Ok(scope) => scope,
            Err(err) => {
                diag.record(&err);
                None
            }
        };

        diag.log(
            Level::DEBUG,
            format_args!(
                "{:#x} -> {:#x} (sp {:#x} -> {:#x})",
                snapshot.ip, stepped.caller.ip, snapshot.sp, stepped.caller.sp
            ),
        );
        Ok(Step {
            caller: stepped.caller,
            function: Some(entry),
            backend: Some(stepped.backend),
            handler: stepped.handler,
            scope,
        })
    }

    /// Steps until a sentinel, a lookup miss past the first frame, the frame
    /// limit or a failure.
    #[instrument(level = "debug", skip_all, fields(ip = snapshot.ip, sp = snapshot.sp))]
    pub fn walk_full_stack(&self, snapshot: RegisterSnapshot, diag: &mut Diagnostics) -> Walk {
        let mut frames = vec![snapshot];
        let mut steps = 0;
        let mut current = snapshot;

        let end = loop {
            if frames.len() >= self.walk.max_frames {
                diag.log(Level::WARN, format_args!("stopping after {} frames", frames.len()));
                break WalkEnd::FrameLimit;
            }
            // Only the innermost frame may be a leaf.
            if steps > 0 && self.table.lookup(current.ip).is_none() {
                diag.log(
                    Level::DEBUG,
                    format_args!("no unwind info for {:#x}, end of walk", current.ip),
                );
                break WalkEnd::LookupMiss;
            }

            let step = match self.step_one_frame(&current, diag) {
                Ok(step) => step,
                Err(err) => break WalkEnd::Failed(err),
            };
            steps += 1;

            let caller = step.caller;
            if caller.ip == 0 || caller.sp == 0 {
                break WalkEnd::Sentinel;
            }
            if caller.sp <= current.sp {
                let err = UnwindError::StepFailure {
                    address: current.ip,
                    reason: "stack pointer did not move up",
                };
                diag.record(&err);
                break WalkEnd::Failed(err);
            }

            frames.push(caller);
            current = caller;
        };

        debug!(frames = frames.len(), steps, ?end, "walk done");
        Walk { frames, steps, end }
    }

    /// The guarded region covering `ip`, if `ip` has unwind information with
    /// a scope table.
    pub fn resolve_scope(&self, ip: u64, diag: &mut Diagnostics) -> Result<Option<ScopeMatch>> {
        let result = self.locate(ip).and_then(|located| match located {
            Some((entry, descriptor)) => scope::resolve_scope(self.memory, &descriptor, ip, entry.image_base),
            None => Ok(None),
        });
        if let Err(err) = &result {
            diag.record(err);
        }
        result
    }

    /// Dispatches `exception` to the handler of the frame at `snapshot`.
    /// `Ok(None)` means the frame has no unwind information at all.
    pub fn dispatch_exception<I>(
        &self,
        invoker: &I,
        snapshot: &RegisterSnapshot,
        exception: &mut I::Exception,
        diag: &mut Diagnostics,
    ) -> Result<Option<Dispatched>>
    where
        I: HandlerInvoker + ?Sized,
    {
        let result = self.locate(snapshot.ip).and_then(|located| match located {
            Some((entry, descriptor)) => {
                dispatch::dispatch_exception(self.memory, invoker, snapshot, &entry, &descriptor, exception)
                    .map(Some)
            }
            None => Ok(None),
        });
        if let Err(err) = &result {
            diag.record(err);
        }
        result
    }

    /// The decision an exception observer makes for the faulting frame:
    /// resume with the registers the handler left, or defer.
    pub fn intercept<I>(
        &self,
        invoker: &I,
        snapshot: &RegisterSnapshot,
        exception: &mut I::Exception,
        diag: &mut Diagnostics,
    ) -> Interception
    where
        I: HandlerInvoker + ?Sized,
    {
        match self.dispatch_exception(invoker, snapshot, exception, diag) {
            Ok(Some(dispatched)) => {
                diag.log(
                    Level::INFO,
                    format_args!(
                        "handler returned {:?}, resuming at {:#x}",
                        dispatched.disposition, dispatched.snapshot.ip
                    ),
                );
                Interception::Resume(dispatched.snapshot)
            }
            Ok(None) | Err(_) => Interception::Defer,
        }
    }
}
