//! Per-VM lowering: handler tables and block lowering.
//!
//! A [`Machine`] owns one VM id's register layout, its lazily created
//! handler table keyed by `(kind, width, operand count)`, and the labels of
//! every lowered block. [`Machine::lift_block`] turns an IR block into a
//! code container of handler invocations with inline operands in the VIP
//! role register; [`Machine::create_handlers`] then materializes one
//! container per handler actually used.

pub(crate) mod emit;
mod handlers;
pub(crate) mod moves;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::asm::{CodeContainer, Item, LabelId, LabelPool};
use crate::codec::OpWidth;
use crate::control::Shuffler;
use crate::error::VirtResult;
use crate::ir::{
    Command, Exit, ExitTarget, HandlerKey, HandlerKind, IrArena, IrBlockRef,
};
use crate::regalloc::RegLayout;

/// Bytes reserved for each VM's logical stack.
const VM_STACK_BYTES: u32 = 4096;

/// Whole-layout restarts after an allocation failure before giving up.
const LAYOUT_RESTARTS: u32 = 4;

/// Compilation settings shared by every machine of one pipeline run.
#[derive(Clone, Debug)]
pub struct MachineSettings {
    /// Seed for all randomness.
    pub seed: u64,
    /// Scratch temporaries reserved per VM. The handlers need two.
    pub temp_count: u8,
    /// Placement attempts per scatter fragment.
    pub alloc_retry_bound: u8,
    /// Shuffle container order before layout. Disables fall-through
    /// elision, which relies on layout order.
    pub shuffle_containers: bool,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            seed: 0x7a10_c0de,
            temp_count: 2,
            alloc_retry_bound: 10,
            shuffle_containers: false,
        }
    }
}

impl MachineSettings {
    /// Replace the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the temp count.
    pub fn with_temp_count(mut self, count: u8) -> Self {
        self.temp_count = count;
        self
    }

    /// Replace the per-fragment retry bound.
    pub fn with_alloc_retry_bound(mut self, bound: u8) -> Self {
        self.alloc_retry_bound = bound;
        self
    }

    /// Enable container shuffling.
    pub fn with_shuffled_containers(mut self, shuffle: bool) -> Self {
        self.shuffle_containers = shuffle;
        self
    }
}

/// Labels of the per-VM runtime frame.
pub(crate) struct VmFrame {
    /// Context area: committed rflags, scratch flags, spill slots.
    pub ctx: LabelId,
    /// Top of the VM stack; `vsp` starts here and grows down.
    pub stack_top: LabelId,
    /// Shared restore path inside the exit handler.
    pub exit_restore: LabelId,
}

/// One VM: register layout, handler table, block labels.
pub struct Machine {
    vm_id: u32,
    layout: RegLayout,
    frame: VmFrame,
    allow_inline: bool,
    handler_labels: FxHashMap<HandlerKey, LabelId>,
    handler_order: Vec<HandlerKey>,
    block_labels: FxHashMap<IrBlockRef, LabelId>,
    body_labels: FxHashMap<IrBlockRef, LabelId>,
}

impl Machine {
    /// Create a machine for `vm_id`, building its randomized register
    /// layout. An allocation failure re-seeds the layout and tries again a
    /// few times before surfacing.
    pub fn new(
        vm_id: u32,
        settings: &MachineSettings,
        rng: &mut Shuffler,
        pool: &mut LabelPool,
    ) -> VirtResult<Self> {
        assert!(settings.temp_count >= 2, "handlers need two temporaries");

        let mut layout = None;
        let mut last_err = None;
        for attempt in 0..LAYOUT_RESTARTS {
            let mut candidate = RegLayout::new(rng, settings.temp_count);
            match candidate.create_mappings(rng, settings.alloc_retry_bound) {
                Ok(()) => {
                    layout = Some(candidate);
                    break;
                }
                Err(e) => {
                    warn!("vm{vm_id}: allocator attempt {attempt} failed, re-seeding");
                    last_err = Some(e);
                }
            }
        }
        let layout = match layout {
            Some(l) => l,
            None => return Err(last_err.expect("failed without error")),
        };

        let frame = VmFrame {
            ctx: pool.create(format!("vm{vm_id}_ctx")),
            stack_top: pool.create(format!("vm{vm_id}_stack_top")),
            exit_restore: pool.create(format!("vm{vm_id}_exit_restore")),
        };

        Ok(Self {
            vm_id,
            layout,
            frame,
            allow_inline: !settings.shuffle_containers,
            handler_labels: FxHashMap::default(),
            handler_order: Vec::new(),
            block_labels: FxHashMap::default(),
            body_labels: FxHashMap::default(),
        })
    }

    /// The VM id this machine lowers for.
    pub fn vm_id(&self) -> u32 {
        self.vm_id
    }

    /// The machine's register layout, for inspection.
    pub fn layout(&self) -> &RegLayout {
        &self.layout
    }

    /// Install the shared block → entry-label map. Contains every block of
    /// the program, not just this VM's, so cross-VM edges can be lowered.
    pub fn add_block_context(&mut self, labels: &FxHashMap<IrBlockRef, LabelId>) {
        self.block_labels = labels.clone();
    }

    /// Lower one IR block. Returns the block container followed by any exit
    /// thunks it needed. `layout_next` names the block laid out immediately
    /// after this one within the same VM, enabling fall-through elision.
    pub fn lift_block(
        &mut self,
        arena: &mut IrArena,
        block: IrBlockRef,
        layout_next: Option<IrBlockRef>,
        pool: &mut LabelPool,
    ) -> VirtResult<Vec<CodeContainer>> {
        debug_assert_eq!(arena[block].discriminator, self.vm_id);

        let mut c = CodeContainer::named(format!("vm{}_block_{:#x}", self.vm_id, arena[block].origin));
        let mut thunks = Vec::new();

        c.bind(self.block_labels[&block]);
        if !arena[block].has_vm_enter() {
            let body = self.body_label(block, pool);
            c.bind(body);
        }

        let commands = arena[block].commands.clone();
        let exit = arena[block].exit;
        let mut exits_lowered = false;
        for command in &commands {
            if matches!(command, Command::VmExit) {
                self.lower_vm_exit(&mut c, &exit, pool)?;
                exits_lowered = true;
                continue;
            }
            self.emit_command(&mut c, block, command, pool)?;
        }

        if !exits_lowered {
            self.lower_exit(&mut c, arena, block, &exit, layout_next, pool, &mut thunks)?;
        }

        let mut out = vec![c];
        out.append(&mut thunks);
        Ok(out)
    }

    /// Materialize every handler created so far, in creation order.
    pub fn create_handlers(&mut self, pool: &mut LabelPool) -> VirtResult<Vec<CodeContainer>> {
        let mut out = Vec::new();
        for key in self.handler_order.clone() {
            let label = self.handler_labels[&key];
            out.push(handlers::build_handler(
                key,
                &self.layout,
                &self.frame,
                label,
                pool,
            )?);
        }
        debug!("vm{}: {} handlers", self.vm_id, out.len());
        Ok(out)
    }

    /// Containers reserving the VM context area and logical stack.
    pub fn data_containers(&self) -> Vec<CodeContainer> {
        let mut ctx = CodeContainer::named(format!("vm{}_ctx", self.vm_id));
        ctx.bind(self.frame.ctx);
        ctx.push(Item::Reserve(crate::ir::CtxSlot::area_size()));

        let mut stack = CodeContainer::named(format!("vm{}_stack", self.vm_id));
        stack.push(Item::Reserve(VM_STACK_BYTES));
        stack.bind(self.frame.stack_top);

        vec![ctx, stack]
    }

    fn body_label(&mut self, block: IrBlockRef, pool: &mut LabelPool) -> LabelId {
        if let Some(&l) = self.body_labels.get(&block) {
            return l;
        }
        let l = pool.create(format!("vm{}_body_{}", self.vm_id, block));
        self.body_labels.insert(block, l);
        l
    }

    /// Resolve a handler label, creating the handler lazily on first use.
    /// Idempotent; the single-threaded pipeline needs no locking.
    fn handler_label(&mut self, key: HandlerKey, pool: &mut LabelPool) -> LabelId {
        if let Some(&l) = self.handler_labels.get(&key) {
            return l;
        }
        if matches!(key.kind, HandlerKind::VmExitRet) {
            // the ret exit joins the shared restore path
            self.handler_label(vm_exit_key(), pool);
        }
        let l = pool.create(format!(
            "vm{}_handler{}",
            self.vm_id,
            self.handler_order.len()
        ));
        self.handler_labels.insert(key, l);
        self.handler_order.push(key);
        l
    }

    /// Emit the invocation of a handler: a call for handlers that return to
    /// the block stream, a tail jump for those that do not.
    fn invoke(&mut self, c: &mut CodeContainer, key: HandlerKey, pool: &mut LabelPool) {
        let label = self.handler_label(key, pool);
        match key.kind {
            HandlerKind::VmExit | HandlerKind::VmExitRet | HandlerKind::BranchCond(_) => {
                c.push(Item::JumpTo(label));
            }
            _ => c.push(Item::CallTo(label)),
        }
    }

    fn emit_command(
        &mut self,
        c: &mut CodeContainer,
        block: IrBlockRef,
        command: &Command,
        pool: &mut LabelPool,
    ) -> VirtResult<()> {
        let vip = self.layout.vip();
        let t0 = self.layout.temp(0);
        let t1 = self.layout.temp(1);

        match *command {
            Command::VmEnter => {
                self.invoke(c, vm_enter_key(), pool);
                let body = self.body_label(block, pool);
                c.bind(body);
            }
            Command::VmExit => unreachable!("lowered by lift_block"),
            Command::PushImm { value, .. } => {
                c.push_inst(emit::mov_ri64(vip, value)?);
                self.invoke(c, push_key(), pool);
            }
            Command::PushReg { reg, width } => {
                moves::emit_gather(c, &self.layout, reg, width, vip, t0)?;
                self.invoke(c, push_key(), pool);
            }
            Command::PopReg { reg, width } => {
                self.invoke(c, pop_key(), pool);
                match width {
                    // a 32-bit write zero-extends the whole register
                    OpWidth::Dword => {
                        c.push_inst(emit::mov_rr(vip, vip, OpWidth::Dword)?);
                        moves::emit_scatter(c, &self.layout, reg, OpWidth::Qword, vip, t0, t1)?;
                    }
                    width => {
                        moves::emit_scatter(c, &self.layout, reg, width, vip, t0, t1)?;
                    }
                }
            }
            Command::PopDiscard { .. } => {
                self.invoke(c, pop_key(), pool);
            }
            Command::FlagsUpdate { defined, .. } => {
                c.push_inst(emit::mov_ri64(vip, defined.bits())?);
                self.invoke(c, key_of(command), pool);
            }
            Command::ContextLoad { slot } | Command::ContextStore { slot } => {
                c.push_inst(emit::mov_ri64(vip, u64::from(slot.byte_offset()))?);
                self.invoke(c, key_of(command), pool);
            }
            Command::MemRead { .. }
            | Command::MemWrite { .. }
            | Command::Binary { .. }
            | Command::ScaleIndex { .. }
            | Command::SignExtend { .. }
            | Command::ZeroExtend { .. }
            | Command::HandlerCall { .. } => {
                self.invoke(c, key_of(command), pool);
            }
        }
        Ok(())
    }

    /// Lower the `VmExit` command against the block's exit descriptor.
    fn lower_vm_exit(
        &mut self,
        c: &mut CodeContainer,
        exit: &Exit,
        pool: &mut LabelPool,
    ) -> VirtResult<()> {
        match *exit {
            Exit::Branch {
                target: ExitTarget::External(rva),
            } => {
                let vip = self.layout.vip();
                c.push_inst(emit::mov_ri64(vip, rva)?);
                c.push_inst(emit::alu_rr(
                    crate::ir::BinaryOp::Add,
                    vip,
                    self.layout.vbase(),
                    OpWidth::Qword,
                )?);
                self.emit_command_raw(c, Command::HandlerCall { key: vm_exit_key() }, pool);
            }
            Exit::Ret => {
                self.emit_command_raw(
                    c,
                    Command::HandlerCall {
                        key: vm_exit_ret_key(),
                    },
                    pool,
                );
            }
            ref other => unreachable!("VmExit with in-VM exit {other:?}"),
        }
        Ok(())
    }

    fn emit_command_raw(&mut self, c: &mut CodeContainer, command: Command, pool: &mut LabelPool) {
        if let Command::HandlerCall { key } = command {
            self.invoke(c, key, pool);
        }
    }

    /// Lower an in-VM exit descriptor.
    #[allow(clippy::too_many_arguments)]
    fn lower_exit(
        &mut self,
        c: &mut CodeContainer,
        arena: &mut IrArena,
        block: IrBlockRef,
        exit: &Exit,
        layout_next: Option<IrBlockRef>,
        pool: &mut LabelPool,
        thunks: &mut Vec<CodeContainer>,
    ) -> VirtResult<()> {
        match *exit {
            Exit::Branch { target } => match target {
                ExitTarget::Block(t) if arena[t].discriminator == self.vm_id => {
                    // falling through must land past the prologue, so only a
                    // prologue-free successor can be elided
                    if self.allow_inline && layout_next == Some(t) && !arena[t].has_vm_enter() {
                        debug!("{block}: eliding jump to layout successor {t}");
                        arena.get_mut(block).inline_next = true;
                    } else {
                        let body = self.body_label(t, pool);
                        c.push(Item::JumpTo(body));
                    }
                }
                target => self.emit_leave(c, target, pool)?,
            },
            Exit::CondPair {
                cond,
                taken,
                fallthrough,
            } => {
                let taken_label = self.branch_target_label(arena, taken, pool, thunks)?;
                let fallthrough_label =
                    self.branch_target_label(arena, fallthrough, pool, thunks)?;
                c.push(Item::MovLabelVa {
                    reg: self.layout.vcsret(),
                    label: taken_label,
                });
                c.push(Item::MovLabelVa {
                    reg: self.layout.vcs(),
                    label: fallthrough_label,
                });
                self.invoke(c, branch_cond_key(cond), pool);
            }
            Exit::Ret => unreachable!("ret exits carry a VmExit command"),
        }
        Ok(())
    }

    /// Label for one conditional edge: the successor's body for same-VM
    /// targets, otherwise a thunk that leaves the VM.
    fn branch_target_label(
        &mut self,
        arena: &IrArena,
        target: ExitTarget,
        pool: &mut LabelPool,
        thunks: &mut Vec<CodeContainer>,
    ) -> VirtResult<LabelId> {
        if let ExitTarget::Block(t) = target {
            if arena[t].discriminator == self.vm_id {
                return Ok(self.body_label(t, pool));
            }
        }
        let label = pool.create(format!("vm{}_thunk", self.vm_id));
        let mut thunk = CodeContainer::named(format!("vm{}_exit_thunk", self.vm_id));
        thunk.bind(label);
        self.emit_leave(&mut thunk, target, pool)?;
        thunks.push(thunk);
        Ok(label)
    }

    /// VM-leaving transfer: load the destination, tail-jump the exit
    /// handler. Cross-VM edges land on the target block's entry label,
    /// which re-enters under the target VM.
    fn emit_leave(
        &mut self,
        c: &mut CodeContainer,
        target: ExitTarget,
        pool: &mut LabelPool,
    ) -> VirtResult<()> {
        let vip = self.layout.vip();
        match target {
            ExitTarget::Block(t) => {
                c.push(Item::MovLabelVa {
                    reg: vip,
                    label: self.block_labels[&t],
                });
            }
            ExitTarget::External(rva) => {
                c.push_inst(emit::mov_ri64(vip, rva)?);
                c.push_inst(emit::alu_rr(
                    crate::ir::BinaryOp::Add,
                    vip,
                    self.layout.vbase(),
                    OpWidth::Qword,
                )?);
            }
        }
        self.invoke(c, vm_exit_key(), pool);
        Ok(())
    }
}

fn vm_enter_key() -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::VmEnter,
        width: OpWidth::Qword,
        operands: 0,
    }
}

fn vm_exit_key() -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::VmExit,
        width: OpWidth::Qword,
        operands: 1,
    }
}

fn vm_exit_ret_key() -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::VmExitRet,
        width: OpWidth::Qword,
        operands: 0,
    }
}

fn push_key() -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::Push,
        width: OpWidth::Qword,
        operands: 1,
    }
}

fn pop_key() -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::Pop,
        width: OpWidth::Qword,
        operands: 0,
    }
}

fn branch_cond_key(cond: crate::ir::condcodes::VmCond) -> HandlerKey {
    HandlerKey {
        kind: HandlerKind::BranchCond(cond),
        width: OpWidth::Qword,
        operands: 0,
    }
}

fn key_of(command: &Command) -> HandlerKey {
    command
        .handler_key()
        .expect("every dispatched command has a handler key")
}
