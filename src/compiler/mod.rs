//! Graph compiler: task graph to bytecode.
//!
//! The graph is list-scheduled once; the resulting order is emitted once per
//! batch pass. Every instruction-bearing node waits on the deduplicated list
//! of its direct producers, and each node's event is appended to every list
//! that contains it right after the node is issued.

use crate::bytecode::{Assembler, BytecodeProgram, Instruction, Opcode};
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::graph::{schedule_order, DependencyAnalysis, NodeId, NodeKind, TaskGraph};
use std::collections::HashMap;
use tracing::debug;

/// Transfer window of one pass over the bound objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub offset: u64,
    /// Bytes per transfer; 0 means the whole object.
    pub length: u64,
    /// Thread override for launches; 0 means the task's own domain.
    pub threads: u64,
}

impl Pass {
    const WHOLE: Pass = Pass {
        offset: 0,
        length: 0,
        threads: 0,
    };
}

/// How the program makes its results visible to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalSync {
    /// The last instruction is a stream-out; make it blocking.
    BlockingStreamOut,
    /// Append a barrier over the list of all sink slots.
    Barrier { list: usize },
}

/// Compile `graph` against the tables of `ctx`.
pub fn compile(
    graph: &TaskGraph,
    ctx: &ExecutionContext,
    batch_size: Option<u64>,
    config: &Config,
) -> Result<BytecodeProgram> {
    let device = single_context(graph)?;
    ctx.device(device)?;

    let analysis = DependencyAnalysis::analyze(graph)?;
    let instruction_nodes = graph.instruction_nodes();
    let slot_of: HashMap<NodeId, u32> = instruction_nodes
        .iter()
        .enumerate()
        .map(|(slot, node)| (*node, slot as u32))
        .collect();

    let mut table = DependencyTable::default();
    let mut wait_list: HashMap<NodeId, usize> = HashMap::new();
    for node in &instruction_nodes {
        let slots: Vec<u32> = analysis
            .dependencies(*node)
            .ones()
            .filter_map(|dep| slot_of.get(&dep).copied())
            .collect();
        if !slots.is_empty() {
            wait_list.insert(*node, table.intern(slots));
        }
    }

    let order = schedule_order(graph, &analysis)?;

    let final_sync = match order.last().and_then(|id| graph.node(*id)) {
        Some(node) if matches!(node.kind, NodeKind::StreamOut { .. }) => FinalSync::BlockingStreamOut,
        _ => {
            let sinks: Vec<u32> = analysis
                .sinks()
                .iter()
                .filter_map(|node| slot_of.get(node).copied())
                .collect();
            FinalSync::Barrier {
                list: table.intern(sinks),
            }
        }
    };

    let passes = plan_passes(ctx, batch_size)?;

    let mut asm = Assembler::new(config.max_bytecode_size);
    asm.emit(Instruction::Begin {
        slots: instruction_nodes.len(),
        tasks: ctx.num_tasks(),
        dep_lists: table.len(),
    })?;
    asm.emit(Instruction::Context { device })?;

    for pass in &passes {
        for node_id in &order {
            let node = graph
                .node(*node_id)
                .ok_or_else(|| Error::config(format!("scheduled node {} vanished", node_id)))?;
            let deps = wait_list.get(node_id).copied();
            let instruction = match node.kind {
                NodeKind::Task { task } => Instruction::Launch {
                    task,
                    device,
                    deps,
                    offset: pass.offset,
                    threads: pass.threads,
                },
                NodeKind::StreamIn { object } => Instruction::StreamIn {
                    object,
                    offset: pass.offset,
                    length: pass.length,
                    deps,
                },
                NodeKind::StreamOut { object } => Instruction::StreamOut {
                    object,
                    offset: pass.offset,
                    length: pass.length,
                    deps,
                },
                _ => continue,
            };
            asm.emit(instruction)?;

            if let Some(slot) = slot_of.get(node_id) {
                for list in table.lists_containing(*slot) {
                    asm.emit(Instruction::AddDep { list })?;
                }
            }
        }
    }

    match final_sync {
        FinalSync::BlockingStreamOut => asm.rewrite_last(Opcode::StreamOut, Opcode::StreamOutBlocking)?,
        FinalSync::Barrier { list } => asm.emit(Instruction::Barrier { deps: Some(list) })?,
    }
    asm.emit(Instruction::End)?;

    debug!(
        context = ctx.name(),
        nodes = graph.len(),
        slots = instruction_nodes.len(),
        dep_lists = table.len(),
        passes = passes.len(),
        instructions = asm.instruction_count(),
        bytes = asm.len(),
        "task graph compiled"
    );

    Ok(asm.finish(table.into_lists()))
}

fn single_context(graph: &TaskGraph) -> Result<usize> {
    let contexts = graph.contexts();
    match contexts.as_slice() {
        [id] => match graph.node(*id).map(|n| n.kind) {
            Some(NodeKind::Context { device }) => Ok(device),
            _ => Err(Error::config("context node is malformed")),
        },
        [] => Err(Error::config("task graph has no context node")),
        many => Err(Error::config(format!(
            "multiple contexts are not supported ({} context nodes)",
            many.len()
        ))),
    }
}

/// Split the bound objects into transfer passes of `batch_size` bytes.
pub fn plan_passes(ctx: &ExecutionContext, batch_size: Option<u64>) -> Result<Vec<Pass>> {
    let batch = match batch_size {
        None => return Ok(vec![Pass::WHOLE]),
        Some(0) => return Err(Error::config("batch size must be greater than zero")),
        Some(batch) => batch,
    };

    let mut shape = None;
    for object in ctx.objects() {
        let elem = object.element_type().ok_or_else(|| {
            Error::config(format!("batching is not supported for scalar object {}", object.handle()))
        })?;
        let current = (elem, object.byte_len() as u64);
        match shape {
            None => shape = Some(current),
            Some(expected) if expected != current => {
                return Err(Error::config("batching with mixed input not supported"));
            }
            Some(_) => {}
        }
    }
    let (elem, total) = shape.ok_or_else(|| Error::config("batching requires at least one bound object"))?;
    let elem_size = elem.size() as u64;
    if batch % elem_size != 0 {
        return Err(Error::config(format!(
            "batch size {} is not a multiple of the {:?} element size {}",
            batch, elem, elem_size
        )));
    }

    let chunks = total / batch;
    let remainder = total % batch;
    if chunks == 0 {
        return Ok(vec![Pass {
            offset: 0,
            length: 0,
            threads: total / elem_size,
        }]);
    }

    let mut passes: Vec<Pass> = (0..chunks)
        .map(|i| Pass {
            offset: i * batch,
            length: batch,
            threads: batch / elem_size,
        })
        .collect();
    if remainder > 0 {
        passes.push(Pass {
            offset: chunks * batch,
            length: remainder,
            threads: remainder / elem_size,
        });
    }
    Ok(passes)
}

#[derive(Debug, Default)]
struct DependencyTable {
    lists: Vec<Vec<u32>>,
    index: HashMap<Vec<u32>, usize>,
}

impl DependencyTable {
    fn intern(&mut self, slots: Vec<u32>) -> usize {
        if let Some(existing) = self.index.get(&slots) {
            return *existing;
        }
        let id = self.lists.len();
        self.index.insert(slots.clone(), id);
        self.lists.push(slots);
        id
    }

    fn lists_containing(&self, slot: u32) -> Vec<usize> {
        self.lists
            .iter()
            .enumerate()
            .filter(|(_, list)| list.binary_search(&slot).is_ok())
            .map(|(id, _)| id)
            .collect()
    }

    fn len(&self) -> usize {
        self.lists.len()
    }

    fn into_lists(self) -> Vec<Vec<u32>> {
        self.lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::graph::GraphBuilder;
    use crate::state::{HostObject, ObjectRegistry};
    use crate::task::Task;
    use std::sync::Arc;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("compiler", Arc::new(ObjectRegistry::new()));
        ctx.add_device(Arc::new(HostDevice::new().unwrap()));
        ctx
    }

    fn vector_add(ctx: &mut ExecutionContext, n: usize) -> (TaskGraph, HostObject) {
        let a = ctx.registry().array(&vec![1.0f32; n]);
        let b = ctx.registry().array(&vec![2.0f32; n]);
        let c = ctx.registry().zeroed::<f32>(n);
        let mut builder = GraphBuilder::new(ctx, 0).unwrap();
        builder.stream_in(&a).unwrap();
        builder.stream_in(&b).unwrap();
        builder
            .task(Task::new("add", "vector_add").read(&a).read(&b).write(&c).domain(&[n as u64]))
            .unwrap();
        builder.stream_out(&c).unwrap();
        (builder.build(), c)
    }

    fn opcodes(program: &BytecodeProgram) -> Vec<Opcode> {
        program.decode().unwrap().iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn test_vector_add_program() {
        let mut ctx = context();
        let (graph, _) = vector_add(&mut ctx, 256);
        let program = compile(&graph, &ctx, None, &Config::default()).unwrap();

        assert_eq!(
            opcodes(&program),
            vec![
                Opcode::Begin,
                Opcode::Context,
                Opcode::StreamIn,
                Opcode::AddDep,
                Opcode::StreamIn,
                Opcode::AddDep,
                Opcode::Launch,
                Opcode::AddDep,
                Opcode::StreamOutBlocking,
                Opcode::End,
            ]
        );
        assert_eq!(program.dep_lists(), &[vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_barrier_when_last_node_is_a_task() {
        let mut ctx = context();
        let a = ctx.registry().array(&[1i32; 8]);
        let b = ctx.registry().zeroed::<i32>(8);
        let mut builder = GraphBuilder::new(&mut ctx, 0).unwrap();
        builder.stream_in(&a).unwrap();
        builder
            .task(Task::new("t", "copy").read(&a).write(&b).domain(&[8]))
            .unwrap();
        let graph = builder.build();

        let program = compile(&graph, &ctx, None, &Config::default()).unwrap();
        let instructions = program.decode().unwrap();
        let n = instructions.len();
        assert_eq!(instructions[n - 1], Instruction::End);
        // slot 1 (the task) is the only sink
        let barrier_list = program.dep_lists().iter().position(|l| l == &vec![1]).unwrap();
        assert_eq!(instructions[n - 2], Instruction::Barrier { deps: Some(barrier_list) });
        assert_eq!(instructions[n - 3], Instruction::AddDep { list: barrier_list });
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut ctx = context();
        let (graph, _) = vector_add(&mut ctx, 64);
        let first = compile(&graph, &ctx, Some(128), &Config::default()).unwrap();
        let second = compile(&graph, &ctx, Some(128), &Config::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_multiple_contexts_rejected() {
        let ctx = context();
        let mut graph = TaskGraph::new();
        graph.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        graph.add_node(NodeKind::Context { device: 0 }, vec![]).unwrap();
        let err = compile(&graph, &ctx, None, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("multiple contexts"));

        let err = compile(&TaskGraph::new(), &ctx, None, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_small_budget_is_recoverable() {
        let mut ctx = context();
        let (graph, _) = vector_add(&mut ctx, 64);
        let config = Config::builder().max_bytecode_size(32).build().unwrap();
        let err = compile(&graph, &ctx, None, &config).unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("increase max bytecode size"));
    }

    #[test]
    fn test_batch_passes() {
        let mut ctx = context();
        vector_add(&mut ctx, 1000);

        let passes = plan_passes(&ctx, Some(1024)).unwrap();
        assert_eq!(
            passes,
            vec![
                Pass { offset: 0, length: 1024, threads: 256 },
                Pass { offset: 1024, length: 1024, threads: 256 },
                Pass { offset: 2048, length: 1024, threads: 256 },
                Pass { offset: 3072, length: 928, threads: 232 },
            ]
        );

        let passes = plan_passes(&ctx, Some(8192)).unwrap();
        assert_eq!(passes, vec![Pass { offset: 0, length: 0, threads: 1000 }]);

        assert!(plan_passes(&ctx, Some(0)).is_err());
        assert!(plan_passes(&ctx, Some(6)).is_err());
    }

    #[test]
    fn test_batching_rejects_mixed_input() {
        let mut ctx = context();
        let a = ctx.registry().array(&[1.0f32; 16]);
        let b = ctx.registry().array(&[1.0f64; 16]);
        ctx.bind(&a);
        ctx.bind(&b);
        let err = plan_passes(&ctx, Some(16)).unwrap_err();
        assert!(err.to_string().contains("batching with mixed input not supported"));

        let mut ctx = context();
        let s = ctx.registry().scalar(3i32);
        ctx.bind(&s);
        assert!(plan_passes(&ctx, Some(4)).is_err());
    }

    #[test]
    fn test_batched_program_repeats_passes() {
        let mut ctx = context();
        let (graph, _) = vector_add(&mut ctx, 256);
        let program = compile(&graph, &ctx, Some(512), &Config::default()).unwrap();
        let launches = program
            .decode()
            .unwrap()
            .into_iter()
            .filter(|i| i.opcode() == Opcode::Launch)
            .count();
        assert_eq!(launches, 2);
    }

    #[test]
    fn test_batch_equal_to_total_matches_unbatched() {
        let mut ctx = context();
        let (graph, _) = vector_add(&mut ctx, 64);
        let whole = compile(&graph, &ctx, None, &Config::default()).unwrap();
        let batched = compile(&graph, &ctx, Some(256), &Config::default()).unwrap();

        let strip = |program: &BytecodeProgram| -> Vec<Instruction> {
            program
                .decode()
                .unwrap()
                .into_iter()
                .map(|inst| match inst {
                    Instruction::Launch { task, device, deps, .. } => Instruction::Launch {
                        task,
                        device,
                        deps,
                        offset: 0,
                        threads: 0,
                    },
                    Instruction::StreamIn { object, deps, .. } => Instruction::StreamIn {
                        object,
                        offset: 0,
                        length: 0,
                        deps,
                    },
                    Instruction::StreamOutBlocking { object, deps, .. } => Instruction::StreamOutBlocking {
                        object,
                        offset: 0,
                        length: 0,
                        deps,
                    },
                    other => other,
                })
                .collect()
        };
        assert_eq!(strip(&whole), strip(&batched));
        assert_eq!(whole.dep_lists(), batched.dep_lists());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn passes_partition_the_object(n in 1usize..2048, batch_elems in 1u64..600) {
                let mut ctx = context();
                let a = ctx.registry().zeroed::<u32>(n);
                ctx.bind(&a);
                let total = n as u64 * 4;
                let passes = plan_passes(&ctx, Some(batch_elems * 4)).unwrap();

                if batch_elems * 4 > total {
                    prop_assert_eq!(passes, vec![Pass { offset: 0, length: 0, threads: n as u64 }]);
                } else {
                    let mut next = 0;
                    for pass in &passes {
                        prop_assert_eq!(pass.offset, next);
                        prop_assert!(pass.length > 0 && pass.length <= batch_elems * 4);
                        prop_assert_eq!(pass.threads * 4, pass.length);
                        next += pass.length;
                    }
                    prop_assert_eq!(next, total);
                }
            }

            #[test]
            fn chains_compile_to_one_instruction_per_node(tasks in 1usize..12, passes in 1u64..5) {
                let mut ctx = context();
                let objects: Vec<HostObject> =
                    (0..=tasks).map(|_| ctx.registry().zeroed::<i32>(16 * passes as usize)).collect();
                let mut builder = GraphBuilder::new(&mut ctx, 0).unwrap();
                builder.stream_in(&objects[0]).unwrap();
                for t in 0..tasks {
                    builder
                        .task(Task::new(format!("t{}", t), "copy").read(&objects[t]).write(&objects[t + 1]).domain(&[16]))
                        .unwrap();
                }
                builder.stream_out(&objects[tasks]).unwrap();
                let graph = builder.build();

                let program = compile(&graph, &ctx, Some(64), &Config::default()).unwrap();
                let ops = opcodes(&program);
                let count = |op: Opcode| ops.iter().filter(|o| **o == op).count();
                prop_assert_eq!(count(Opcode::Begin), 1);
                prop_assert_eq!(count(Opcode::End), 1);
                prop_assert_eq!(count(Opcode::Launch), tasks * passes as usize);
                prop_assert_eq!(count(Opcode::StreamIn), passes as usize);
                prop_assert_eq!(count(Opcode::StreamOut) + count(Opcode::StreamOutBlocking), passes as usize);
                prop_assert_eq!(ops.last(), Some(&Opcode::End));
                prop_assert_eq!(ops[ops.len() - 2], Opcode::StreamOutBlocking);
            }
        }
    }
}
