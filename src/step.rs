//! Stepping one frame with an unwind descriptor.
//!
//! There are two backends. The software backend interprets the codes and
//! then pops the return address. The platform backend hands the frame to
//! the host's virtual unwinder, which also knows about epilogues and codes
//! we do not. The shape of the descriptor picks the backend; both see the
//! same chained-descriptor composition.


use alloc::vec::Vec;

use crate::{
    descriptor::{UnwindCode, UnwindDescriptor, UnwindOp},
    error::{Result, UnwindError},
    memory::Memory,
    scope::{resolve_scope, ScopeMatch},
    snapshot::RegisterSnapshot,
    table::FunctionEntry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepperConfig {
    /// Use the platform unwinder whenever one is present, even for frames
    /// the software backend understands.
    pub prefer_platform: bool,
    /// How many chained descriptors are followed before giving up.
    pub max_chain_depth: usize,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            prefer_platform: false,
            max_chain_depth: 32,
        }
    }
}

/// Result of one platform virtual unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualFrame {
    pub caller: RegisterSnapshot,
    /// Personality routine of the unwound frame, if it has one.
    pub handler: Option<u64>,
    pub establisher_frame: u64,
}

/// The platform's own virtual unwind primitive.
pub trait VirtualUnwind {
    /// Unwinds the frame described by `entry` starting from `snapshot`.
    /// `None` means the primitive declined.
    fn virtual_unwind(&self, entry: &FunctionEntry, snapshot: &RegisterSnapshot) -> Option<VirtualFrame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Software,
    Platform,
}

/// Register state after the codes ran, before the return address is
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreted {
    pub state: RegisterSnapshot,
    /// A machine frame already restored ip and sp.
    pub machine_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stepped {
    pub caller: RegisterSnapshot,
    pub backend: Backend,
    pub handler: Option<u64>,
    /// Scope lookup for frames with a handler. A broken scope table does not
    /// stop the step, it is only reported.
    pub scope: Result<Option<ScopeMatch>>,
}

pub struct FrameStepper<'a, M: ?Sized> {
    memory: &'a M,
    platform: Option<&'a dyn VirtualUnwind>,
    config: StepperConfig,
}

impl<'a, M: Memory + ?Sized> FrameStepper<'a, M> {
    pub fn new(memory: &'a M, config: StepperConfig) -> Self {
        Self {
            memory,
            platform: None,
            config,
        }
    }

    pub fn with_platform(mut self, platform: &'a dyn VirtualUnwind) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Produces the caller's registers. Only the flags word survives from
    /// `snapshot`, everything else comes from the unwound frame.
    #[instrument(level = "debug", skip_all, fields(ip = snapshot.ip, sp = snapshot.sp))]
    pub fn step(
        &self,
        entry: &FunctionEntry,
        descriptor: &UnwindDescriptor,
        snapshot: &RegisterSnapshot,
    ) -> Result<Stepped> {
        if snapshot.sp == 0 {
            return Err(UnwindError::InvalidStackPointer);
        }

        let scope = if descriptor.flags.has_handler() {
            resolve_scope(self.memory, descriptor, snapshot.ip, entry.image_base)
        } else {
            Ok(None)
        };

        let chain = self.load_chain(entry, descriptor)?;
        let interpreted = self.interpret_with(entry, descriptor, &chain, snapshot)?;

        let all_known = descriptor.is_fully_known() && chain.iter().all(UnwindDescriptor::is_fully_known);
        let platform = self.platform.filter(|_| self.config.prefer_platform || !all_known);

        let (mut caller, handler, backend) = match platform {
            None if all_known => {
                let mut caller = interpreted.state;
                if !interpreted.machine_frame {
                    caller.ip = self.memory.read_u64(caller.sp)?;
                    caller.sp = advance(caller.sp, 8, snapshot.ip)?;
                }
                let handler = descriptor
                    .handler()
                    .filter(|h| h.handler_rva != 0)
                    .map(|h| entry.image_base + u64::from(h.handler_rva));
                (caller, handler, Backend::Software)
            }
            None => {
                debug!("descriptor has codes only the platform understands");
                return Err(UnwindError::StepFailure {
                    address: snapshot.ip,
                    reason: "no platform unwinder for this frame",
                });
            }
            Some(platform) => {
                trace!(intermediate = ?interpreted.state, "handing frame to the platform");
                let Some(frame) = platform.virtual_unwind(entry, snapshot) else {
                    return Err(UnwindError::StepFailure {
                        address: snapshot.ip,
                        reason: "platform unwinder declined",
                    });
                };
                (frame.caller, frame.handler, Backend::Platform)
            }
        };
        caller.flags = snapshot.flags;

        debug!(?backend, "caller ip={:#x} sp={:#x}", caller.ip, caller.sp);
        Ok(Stepped {
            caller,
            backend,
            handler,
            scope,
        })
    }

    /// Runs the codes of `descriptor` and everything it chains to.
    pub fn interpret(
        &self,
        entry: &FunctionEntry,
        descriptor: &UnwindDescriptor,
        snapshot: &RegisterSnapshot,
    ) -> Result<Interpreted> {
        let chain = self.load_chain(entry, descriptor)?;
        self.interpret_with(entry, descriptor, &chain, snapshot)
    }

    /// Follows chain links. The returned list is ordered from the first
    /// link to the last.
    fn load_chain(&self, entry: &FunctionEntry, descriptor: &UnwindDescriptor) -> Result<Vec<UnwindDescriptor>> {
        let mut chain = Vec::new();
        let mut link = descriptor.chain();
        while let Some(function) = link {
            if chain.len() >= self.config.max_chain_depth {
                warn!(limit = self.config.max_chain_depth, "giving up on chained descriptors");
                return Err(UnwindError::ChainTooDeep {
                    address: descriptor.address,
                    limit: self.config.max_chain_depth,
                });
            }
            let address = entry.image_base + u64::from(function.unwind_info);
            trace!(depth = chain.len(), "following chain link to {address:#x}");
            let next = UnwindDescriptor::load(self.memory, address)?;
            link = next.chain();
            chain.push(next);
        }
        Ok(chain)
    }

    fn interpret_with(
        &self,
        entry: &FunctionEntry,
        descriptor: &UnwindDescriptor,
        chain: &[UnwindDescriptor],
        snapshot: &RegisterSnapshot,
    ) -> Result<Interpreted> {
        let mut interpreted = Interpreted {
            state: *snapshot,
            machine_frame: false,
        };

        // A chained prologue logically runs before the one that links to
        // it, so the deepest link is undone first.
        for chained in chain.iter().rev() {
            for code in &chained.codes {
                self.apply(chained, code, &mut interpreted, snapshot.ip)?;
            }
        }

        let offset = snapshot.ip.wrapping_sub(entry.begin_address());
        let in_prologue = offset < u64::from(descriptor.prologue_size);
        for code in &descriptor.codes {
            if in_prologue && u64::from(code.prologue_offset) > offset {
                trace!(%code.op, "not executed yet at prologue offset {offset:#x}");
                continue;
            }
            self.apply(descriptor, code, &mut interpreted, snapshot.ip)?;
        }

        Ok(interpreted)
    }

    fn apply(
        &self,
        descriptor: &UnwindDescriptor,
        code: &UnwindCode,
        interpreted: &mut Interpreted,
        ip: u64,
    ) -> Result<()> {
        let state = &mut interpreted.state;
        let sp = state.sp;
        trace!("{:#04x}: {} (sp={sp:#x})", code.prologue_offset, code.op);

        match code.op {
            UnwindOp::PushNonvolatile { register } => {
                let value = self.memory.read_u64(sp)?;
                state.set_register(register, value);
                state.sp = advance(sp, 8, ip)?;
            }
            UnwindOp::AllocSmall { slots } => {
                state.sp = advance(sp, u64::from(slots) * 8, ip)?;
            }
            UnwindOp::AllocLarge(size) => {
                state.sp = advance(sp, size.size(), ip)?;
            }
            UnwindOp::SetFramePointer => match descriptor.frame_register {
                Some(frame) => {
                    state.sp = state
                        .register(frame.register)
                        .checked_sub(frame.offset())
                        .ok_or(UnwindError::StepFailure {
                            address: ip,
                            reason: "frame register below its offset",
                        })?;
                }
                None => warn!("SET_FPREG without a frame register, ignored"),
            },
            UnwindOp::SaveNonvolatile { register, slots } => {
                let value = self.memory.read_u64(advance(sp, u64::from(slots) * 8, ip)?)?;
                state.set_register(register, value);
            }
            UnwindOp::SaveNonvolatileFar { register, offset } => {
                let value = self.memory.read_u64(advance(sp, u64::from(offset), ip)?)?;
                state.set_register(register, value);
            }
            UnwindOp::SaveXmm128 { register, units } => {
                let value = self.memory.read_u128(advance(sp, u64::from(units) * 16, ip)?)?;
                state.set_xmm(register, value);
            }
            UnwindOp::SaveXmm128Far { register, offset } => {
                let value = self.memory.read_u128(advance(sp, u64::from(offset), ip)?)?;
                state.set_xmm(register, value);
            }
            UnwindOp::PushMachineFrame { error_code } => {
                // RIP, CS, EFLAGS, old RSP, SS
                let frame = advance(sp, if error_code { 8 } else { 0 }, ip)?;
                state.ip = self.memory.read_u64(frame)?;
                state.sp = self.memory.read_u64(advance(frame, 24, ip)?)?;
                interpreted.machine_frame = true;
            }
            UnwindOp::Unknown { kind, .. } => {
                trace!(kind, "skipping unknown unwind code");
            }
        }
        Ok(())
    }
}

fn advance(sp: u64, by: u64, ip: u64) -> Result<u64> {
    sp.checked_add(by).ok_or(UnwindError::StepFailure {
        address: ip,
        reason: "stack pointer overflow",
    })
}
