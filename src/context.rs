//! The end-to-end virtualization pipeline.
//!
//! [`Virtualizer`] wires the components together for one unit of
//! compilation: disassemble, lift, assign VMs, optimize, lower each VM's
//! blocks and handlers, and compile the section. A failure at any phase
//! aborts the whole unit; no partial output is emitted.

use log::info;
use rustc_hash::FxHashMap;

use crate::asm::{CompiledSection, LabelPool, SectionManager};
use crate::control::Shuffler;
use crate::disasm::SegmentDisasm;
use crate::error::VirtResult;
use crate::ir::IrBlockRef;
use crate::lift;
use crate::machine::{Machine, MachineSettings};
use crate::opt;

/// Owned compilation context: settings plus the entry point of the
/// pipeline.
pub struct Virtualizer {
    settings: MachineSettings,
}

impl Virtualizer {
    /// A virtualizer with the given settings.
    pub fn new(settings: MachineSettings) -> Self {
        Self { settings }
    }

    /// The active settings.
    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    /// Virtualize the code in `bytes`.
    ///
    /// `code_rva` is the address the input bytes were taken from; branch
    /// targets and external edges are interpreted against it. `section_rva`
    /// is the absolute address the produced section will be loaded at.
    ///
    /// Empty input compiles to an empty section with no symbols.
    pub fn virtualize(
        &self,
        bytes: &[u8],
        code_rva: u64,
        section_rva: u64,
    ) -> VirtResult<CompiledSection> {
        let mut pool = LabelPool::new();
        let mut section = SectionManager::new();
        if bytes.is_empty() {
            return section.compile_section(&mut pool, section_rva);
        }

        let mut dasm = SegmentDisasm::new(bytes, code_rva)?;
        let root = dasm.generate_blocks()?;
        let (mut arena, preopt) = lift::translate_segment(&dasm)?;

        // One VM id per block: the strongest partition, so every edge
        // crosses a VM boundary and no two blocks share a schedule.
        let assignments: Vec<(IrBlockRef, u32)> = preopt
            .iter()
            .enumerate()
            .map(|(i, p)| (p.block, i as u32))
            .collect();
        let entry_preopt = preopt
            .iter()
            .find(|p| p.origin == root)
            .expect("root block was lifted")
            .block;

        let result = opt::optimize(&mut arena, &assignments, entry_preopt)?;
        let entry_block = result.tracker[&entry_preopt];
        info!(
            "virtualizing {} bytes into {} blocks over {} vms",
            bytes.len(),
            result.vm_blocks.iter().map(|(_, b)| b.len()).sum::<usize>(),
            result.vm_blocks.len()
        );

        let mut rng = Shuffler::from_seed(self.settings.seed);

        let mut block_labels = FxHashMap::default();
        for (_, blocks) in &result.vm_blocks {
            for &block in blocks {
                block_labels.insert(block, pool.create(format!("block_{block}")));
            }
        }
        let entry_label = pool.create_exported("entry");

        for (vm_id, blocks) in &result.vm_blocks {
            let mut machine = Machine::new(*vm_id, &self.settings, &mut rng, &mut pool)?;
            machine.add_block_context(&block_labels);
            for (i, &block) in blocks.iter().enumerate() {
                let layout_next = blocks.get(i + 1).copied();
                let mut containers = machine.lift_block(&mut arena, block, layout_next, &mut pool)?;
                if block == entry_block {
                    containers[0].bind_start(entry_label);
                }
                section.add_containers(containers);
            }
            section.add_containers(machine.create_handlers(&mut pool)?);
            section.add_containers(machine.data_containers());
        }

        if self.settings.shuffle_containers {
            section.shuffle_containers(&mut rng);
        }
        section.compile_section(&mut pool, section_rva)
    }
}
