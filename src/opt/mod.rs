//! Block-level optimization and VM assignment.
//!
//! Runs after lifting, once the caller has partitioned the preopt blocks
//! into VM ids. Passes, in order:
//!
//! 1. **Flag liveness** — backward dataflow over the block graph; a
//!    [`Command::FlagsUpdate`] whose defined set is dead downstream is
//!    dropped.
//! 2. **Discriminator propagation** — a block reached only from its own VM
//!    no longer re-enters it, so the `VmEnter` prologue is stripped.
//! 3. **Entry pinning** — the designated entry block keeps its prologue and
//!    survives every later pass.
//! 4. **Block merging** — straight-line same-VM pairs with unique
//!    pred/succ relationships are concatenated.
//! 5. **Stack depth check** — predecessors of every block must agree on the
//!    VM stack depth at its entry, and the stack must be empty wherever
//!    control leaves the VM.
//!
//! Output order is deterministic given deterministic input; the allocator
//! and the section assembler both rely on that.

use log::debug;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{VirtError, VirtResult};
use crate::ir::flags::FlagSet;
use crate::ir::{Command, Exit, ExitTarget, IrArena, IrBlockRef};

/// Result of optimization: blocks grouped by VM id plus the tracker mapping
/// every preopt block to the finalized block that absorbed it.
#[derive(Debug)]
pub struct OptimizeResult {
    /// `(vm_id, blocks)` groups, ascending by VM id.
    pub vm_blocks: Vec<(u32, Vec<IrBlockRef>)>,
    /// Preopt block → surviving block. Identity for blocks that were not
    /// merged away.
    pub tracker: FxHashMap<IrBlockRef, IrBlockRef>,
}

/// Run all passes over `arena`.
///
/// `assignments` maps each preopt block to a VM id; `entry` names the
/// pinned entry block.
pub fn optimize(
    arena: &mut IrArena,
    assignments: &[(IrBlockRef, u32)],
    entry: IrBlockRef,
) -> VirtResult<OptimizeResult> {
    for &(block, vm) in assignments {
        arena.get_mut(block).discriminator = vm;
    }

    let mut alive: Vec<IrBlockRef> = assignments.iter().map(|&(b, _)| b).collect();
    alive.sort();

    prune_dead_flag_updates(arena, &alive);
    propagate_discriminators(arena, &alive, entry);
    let tracker = merge_blocks(arena, &mut alive, entry);
    check_stack_depths(arena, &alive, entry)?;

    let mut vm_blocks: Vec<(u32, Vec<IrBlockRef>)> = Vec::new();
    for &block in &alive {
        let vm = arena[block].discriminator;
        match vm_blocks.iter_mut().find(|(id, _)| *id == vm) {
            Some((_, group)) => group.push(block),
            None => vm_blocks.push((vm, vec![block])),
        }
    }
    vm_blocks.sort_by_key(|&(id, _)| id);

    Ok(OptimizeResult { vm_blocks, tracker })
}

fn successors(arena: &IrArena, block: IrBlockRef) -> SmallVec<[IrBlockRef; 2]> {
    arena[block]
        .exit
        .targets()
        .into_iter()
        .filter_map(|t| match t {
            ExitTarget::Block(r) => Some(r),
            ExitTarget::External(_) => None,
        })
        .collect()
}

fn predecessors(
    arena: &IrArena,
    alive: &[IrBlockRef],
) -> FxHashMap<IrBlockRef, SmallVec<[IrBlockRef; 2]>> {
    let mut preds: FxHashMap<IrBlockRef, SmallVec<[IrBlockRef; 2]>> = FxHashMap::default();
    for &block in alive {
        for succ in successors(arena, block) {
            let entry = preds.entry(succ).or_default();
            if !entry.contains(&block) {
                entry.push(block);
            }
        }
    }
    preds
}

/// Pass 1: drop `FlagsUpdate` commands whose defined flags are never read.
fn prune_dead_flag_updates(arena: &mut IrArena, alive: &[IrBlockRef]) {
    // Fixed-point live-in sets over the (possibly cyclic) block graph.
    let mut live_in: FxHashMap<IrBlockRef, FlagSet> = FxHashMap::default();
    let mut changed = true;
    while changed {
        changed = false;
        for &block in alive.iter().rev() {
            let live = block_live_in(arena, block, &live_in);
            if live_in.get(&block).copied().unwrap_or(FlagSet::EMPTY) != live {
                live_in.insert(block, live);
                changed = true;
            }
        }
    }

    for &block in alive {
        let live_out = exit_live_out(arena, block, &live_in);
        let dead = dead_flag_updates(&arena[block].commands, live_out);
        if dead.is_empty() {
            continue;
        }
        debug!("{block}: dropping {} dead flag updates", dead.len());
        let commands = &mut arena.get_mut(block).commands;
        let mut index = 0;
        commands.retain(|_| {
            let keep = !dead.contains(&index);
            index += 1;
            keep
        });
    }
}

fn exit_live_out(
    arena: &IrArena,
    block: IrBlockRef,
    live_in: &FxHashMap<IrBlockRef, FlagSet>,
) -> FlagSet {
    let mut live = FlagSet::EMPTY;
    let exit = &arena[block].exit;
    if matches!(exit, Exit::Ret) {
        live |= FlagSet::STATUS;
    }
    for target in exit.targets() {
        match target {
            // Control leaving the VM makes every status flag observable.
            ExitTarget::External(_) => live |= FlagSet::STATUS,
            ExitTarget::Block(succ) => {
                live |= live_in.get(&succ).copied().unwrap_or(FlagSet::EMPTY)
            }
        }
    }
    live
}

fn block_live_in(
    arena: &IrArena,
    block: IrBlockRef,
    live_in: &FxHashMap<IrBlockRef, FlagSet>,
) -> FlagSet {
    let mut live = exit_live_out(arena, block, live_in);
    for command in arena[block].commands.iter().rev() {
        live = live
            .difference(command.flags_written())
            .union(command.flags_read());
    }
    live
}

/// Indices of `FlagsUpdate` commands in `commands` that define no live flag,
/// given the flags live at the block exit.
fn dead_flag_updates(commands: &[Command], live_out: FlagSet) -> Vec<usize> {
    let mut dead = Vec::new();
    let mut live = live_out;
    for (i, command) in commands.iter().enumerate().rev() {
        if let Command::FlagsUpdate { defined, .. } = command {
            if defined.is_disjoint(live) {
                dead.push(i);
                continue;
            }
        }
        live = live
            .difference(command.flags_written())
            .union(command.flags_read());
    }
    dead
}

/// Pass 2 + 3: strip redundant `VmEnter` prologues, keeping the entry
/// pinned.
fn propagate_discriminators(arena: &mut IrArena, alive: &[IrBlockRef], entry: IrBlockRef) {
    let preds = predecessors(arena, alive);
    for &block in alive {
        if block == entry || !arena[block].has_vm_enter() {
            continue;
        }
        let vm = arena[block].discriminator;
        let reachable_in_vm = match preds.get(&block) {
            Some(list) if !list.is_empty() => {
                list.iter().all(|&p| arena[p].discriminator == vm)
            }
            _ => false,
        };
        if reachable_in_vm {
            debug!("{block}: forwarding discriminator {vm}, dropping VmEnter");
            arena.get_mut(block).commands.remove(0);
        }
    }
}

/// Pass 4: merge straight-line same-VM pairs.
fn merge_blocks(
    arena: &mut IrArena,
    alive: &mut Vec<IrBlockRef>,
    entry: IrBlockRef,
) -> FxHashMap<IrBlockRef, IrBlockRef> {
    let mut tracker: FxHashMap<IrBlockRef, IrBlockRef> =
        alive.iter().map(|&b| (b, b)).collect();

    loop {
        let preds = predecessors(arena, alive);
        let mut merged = None;
        for &a in alive.iter() {
            let b = match arena[a].exit {
                Exit::Branch {
                    target: ExitTarget::Block(b),
                } => b,
                _ => continue,
            };
            if b == a || b == entry {
                continue;
            }
            if arena[a].discriminator != arena[b].discriminator {
                continue;
            }
            if preds.get(&b).map(|p| p.as_slice()) != Some(&[a][..]) {
                continue;
            }
            merged = Some((a, b));
            break;
        }

        let Some((a, b)) = merged else { break };
        debug!("merging {b} into {a}");
        let mut absorbed = std::mem::take(&mut arena.get_mut(b).commands);
        // The prologue was already stripped by discriminator propagation;
        // a single same-VM predecessor is exactly its trigger.
        debug_assert!(!matches!(absorbed.first(), Some(Command::VmEnter)));
        let b_exit = arena[b].exit;
        let a_block = arena.get_mut(a);
        a_block.commands.append(&mut absorbed);
        a_block.exit = b_exit;
        alive.retain(|&r| r != b);
        for dest in tracker.values_mut() {
            if *dest == b {
                *dest = a;
            }
        }
    }

    tracker
}

/// Pass 5: every block's predecessors must agree on the entry stack depth,
/// and the stack must be empty at every VM boundary crossing.
fn check_stack_depths(
    arena: &IrArena,
    alive: &[IrBlockRef],
    entry: IrBlockRef,
) -> VirtResult<()> {
    let mut depth_in: FxHashMap<IrBlockRef, i32> = FxHashMap::default();
    let mut worklist: Vec<IrBlockRef> = Vec::new();

    for &block in alive {
        if block == entry || arena[block].has_vm_enter() {
            depth_in.insert(block, 0);
            worklist.push(block);
        }
    }

    while let Some(block) = worklist.pop() {
        let mut depth = depth_in[&block];
        for command in &arena[block].commands {
            let effect = command.stack_effect();
            depth -= effect.pops.len() as i32;
            if depth < 0 {
                return Err(VirtError::StackImbalance(block));
            }
            depth += effect.pushes.len() as i32;
        }
        depth -= arena[block].exit.pops() as i32;
        if depth < 0 {
            return Err(VirtError::StackImbalance(block));
        }

        let exit = &arena[block].exit;
        if (exit.leaves_vm() || matches!(exit, Exit::Ret)) && depth != 0 {
            return Err(VirtError::StackImbalance(block));
        }

        let vm = arena[block].discriminator;
        for target in exit.targets() {
            match target {
                ExitTarget::External(_) => {
                    if depth != 0 {
                        return Err(VirtError::StackImbalance(block));
                    }
                }
                ExitTarget::Block(succ) => {
                    let expects_empty =
                        arena[succ].has_vm_enter() || arena[succ].discriminator != vm;
                    if expects_empty {
                        if depth != 0 {
                            return Err(VirtError::StackImbalance(succ));
                        }
                    } else {
                        match depth_in.get(&succ) {
                            Some(&d) if d != depth => {
                                return Err(VirtError::StackImbalance(succ));
                            }
                            Some(_) => {}
                            None => {
                                depth_in.insert(succ, depth);
                                worklist.push(succ);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
