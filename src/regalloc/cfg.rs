//! Control-flow graph over a function's assembly instructions (distilled
//! spec §4.4's liveness pass operates over this, not the flat instruction
//! list directly).
//!
//! Grounded on the optimizing backend's basic-block construction inline in
//! `examples/original_source/src/optimization/reg_alloc.c` (its
//! `ControlFlowGraph`/`ctx->cfg` construction, there is no standalone
//! `cfg.c`): a new block starts at
//! every `Label` and immediately after every jump (conditional or not) and
//! every `Ret`; blocks are linked by the fallthrough edge (absent after an
//! unconditional `Jmp`/`Ret`) and by the explicit jump target edge.

use crate::asm::Instruction;
use crate::ident::Ident;
use std::collections::HashMap;

/// One straight-line run of instructions with no internal control transfer.
#[derive(Debug, Clone)]
pub struct Block {
    pub instructions: Vec<Instruction>,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

/// A function's instructions partitioned into basic blocks, plus the
/// `ENTRY`/`EXIT` pseudo-nodes liveness needs a fixed point: `ENTRY`'s
/// successor is the block starting at instruction 0; every block that falls
/// off the end (a `Ret` or the last block with no outgoing jump) points to
/// `EXIT`.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub entry_successors: Vec<usize>,
    pub exit_predecessors: Vec<usize>,
}

impl Cfg {
    /// Build a CFG from a flat instruction stream.
    pub fn build(instructions: &[Instruction]) -> Self {
        let block_starts = find_block_starts(instructions);
        let mut blocks: Vec<Block> = Vec::new();
        let mut label_to_block: HashMap<Ident, usize> = HashMap::new();

        for (i, &start) in block_starts.iter().enumerate() {
            let end = block_starts.get(i + 1).copied().unwrap_or(instructions.len());
            let chunk = instructions[start..end].to_vec();
            if let Some(Instruction::Label(l)) = chunk.first() {
                label_to_block.insert(*l, blocks.len());
            }
            blocks.push(Block {
                instructions: chunk,
                successors: Vec::new(),
                predecessors: Vec::new(),
            });
        }

        let mut entry_successors = Vec::new();
        let mut exit_predecessors = Vec::new();
        if !blocks.is_empty() {
            entry_successors.push(0);
        }

        let num_blocks = blocks.len();
        for idx in 0..num_blocks {
            let last = blocks[idx].instructions.last().cloned();
            let falls_through = !matches!(
                last,
                Some(Instruction::Jmp(_)) | Some(Instruction::Ret)
            );

            match last {
                Some(Instruction::Jmp(target)) => {
                    if let Some(&target_idx) = label_to_block.get(&target) {
                        blocks[idx].successors.push(target_idx);
                    }
                }
                Some(Instruction::JmpCC { target, .. }) => {
                    if let Some(&target_idx) = label_to_block.get(&target) {
                        blocks[idx].successors.push(target_idx);
                    }
                }
                Some(Instruction::Ret) => {
                    exit_predecessors.push(idx);
                }
                _ => {}
            }

            if falls_through {
                if idx + 1 < num_blocks {
                    blocks[idx].successors.push(idx + 1);
                } else {
                    exit_predecessors.push(idx);
                }
            }
        }

        for idx in 0..num_blocks {
            let succs = blocks[idx].successors.clone();
            for s in succs {
                blocks[s].predecessors.push(idx);
            }
        }

        Cfg {
            blocks,
            entry_successors,
            exit_predecessors,
        }
    }

    /// Flattens the CFG's blocks back into one instruction stream, in
    /// original order — used after liveness/coalescing to hand the function
    /// back to the rest of the pipeline.
    pub fn flatten(&self) -> Vec<Instruction> {
        self.blocks
            .iter()
            .flat_map(|b| b.instructions.iter().cloned())
            .collect()
    }
}

fn find_block_starts(instructions: &[Instruction]) -> Vec<usize> {
    if instructions.is_empty() {
        return Vec::new();
    }
    let mut starts = vec![0];
    for (i, inst) in instructions.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let prev_is_transfer = matches!(
            instructions[i - 1],
            Instruction::Jmp(_) | Instruction::JmpCC { .. } | Instruction::Ret
        );
        let is_label = matches!(inst, Instruction::Label(_));
        if prev_is_transfer || is_label {
            starts.push(i);
        }
    }
    starts.dedup();
    starts
}
