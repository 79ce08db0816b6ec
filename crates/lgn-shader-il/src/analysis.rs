//! Control-flow analysis over a function's blocks.
//!
//! Injection passes lean on two facts: the post-order traversal (and its
//! reverse, the emission-friendly order) and dominance, which decides
//! where a check may read a value defined elsewhere. The dominator
//! computation is the iterative intersection scheme over the post order,
//! loosely after Cooper, Harvey and Kennedy.

use fnv::FnvHashMap;

use crate::{BlockId, Function, Op};

/// Successor blocks of a terminator.
fn successors_of(op: &Op) -> Vec<BlockId> {
    match op {
        Op::Branch { target } => vec![*target],
        Op::BranchConditional {
            on_true, on_false, ..
        } => vec![*on_true, *on_false],
        Op::Switch { default, cases, .. } => {
            let mut successors = vec![*default];
            successors.extend(cases.iter().map(|(_, block)| *block));
            successors
        }
        _ => Vec::new(),
    }
}

/// Control-flow graph of one function: edges and traversal orders.
pub struct ControlFlow {
    entry: Option<BlockId>,
    successors: FnvHashMap<BlockId, Vec<BlockId>>,
    predecessors: FnvHashMap<BlockId, Vec<BlockId>>,
    post_order: Vec<BlockId>,
}

impl ControlFlow {
    pub fn compute(function: &Function) -> Self {
        let entry = function.blocks().first().map(|block| block.id());

        let mut successors: FnvHashMap<BlockId, Vec<BlockId>> = FnvHashMap::default();
        let mut predecessors: FnvHashMap<BlockId, Vec<BlockId>> = FnvHashMap::default();

        for block in function.blocks() {
            let targets = block
                .terminator()
                .map(|terminator| successors_of(&terminator.op))
                .unwrap_or_default();

            for target in &targets {
                predecessors.entry(*target).or_default().push(block.id());
            }
            successors.insert(block.id(), targets);
        }

        let mut analysis = Self {
            entry,
            successors,
            predecessors,
            post_order: Vec::new(),
        };
        analysis.build_post_order();
        analysis
    }

    fn build_post_order(&mut self) {
        let Some(entry) = self.entry else {
            return;
        };

        // Iterative depth-first walk; blocks unreachable from the entry
        // stay out of the traversal on purpose.
        let mut visited: FnvHashMap<BlockId, bool> = FnvHashMap::default();
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry, true);

        while let Some((block, next_child)) = stack.pop() {
            let children = self.successors.get(&block).cloned().unwrap_or_default();

            if let Some(child) = children.get(next_child) {
                stack.push((block, next_child + 1));
                if !visited.get(child).copied().unwrap_or(false) {
                    visited.insert(*child, true);
                    stack.push((*child, 0));
                }
            } else {
                self.post_order.push(block);
            }
        }
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.successors.get(&block).map_or(&[], Vec::as_slice)
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.predecessors.get(&block).map_or(&[], Vec::as_slice)
    }

    /// Post order over the reachable blocks.
    pub fn post_order(&self) -> &[BlockId] {
        &self.post_order
    }

    /// Reverse post order, the order passes visit definitions before uses.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        self.post_order.iter().rev().copied().collect()
    }
}

/// Dominator tree over a function's reachable blocks.
pub struct DominatorTree {
    control_flow: ControlFlow,
    immediate_dominators: FnvHashMap<BlockId, BlockId>,
}

impl DominatorTree {
    pub fn compute(function: &Function) -> Self {
        let control_flow = ControlFlow::compute(function);

        let mut immediate_dominators: FnvHashMap<BlockId, BlockId> = FnvHashMap::default();

        let Some(entry) = control_flow.entry() else {
            return Self {
                control_flow,
                immediate_dominators,
            };
        };

        // The entry dominates itself; everything else converges by
        // intersecting predecessor dominators over the post order.
        immediate_dominators.insert(entry, entry);

        let order_index: FnvHashMap<BlockId, usize> = control_flow
            .post_order()
            .iter()
            .enumerate()
            .map(|(index, block)| (*block, index))
            .collect();

        loop {
            let mut mutated = false;

            for block in control_flow.post_order().iter().rev() {
                if *block == entry {
                    continue;
                }

                let mut candidate: Option<BlockId> = None;
                for predecessor in control_flow.predecessors(*block) {
                    if !immediate_dominators.contains_key(predecessor) {
                        continue;
                    }

                    candidate = Some(match candidate {
                        None => *predecessor,
                        Some(current) => intersect(
                            current,
                            *predecessor,
                            &immediate_dominators,
                            &order_index,
                        ),
                    });
                }

                let Some(candidate) = candidate else {
                    continue;
                };

                if immediate_dominators.get(block) != Some(&candidate) {
                    immediate_dominators.insert(*block, candidate);
                    mutated = true;
                }
            }

            if !mutated {
                break;
            }
        }

        Self {
            control_flow,
            immediate_dominators,
        }
    }

    pub fn control_flow(&self) -> &ControlFlow {
        &self.control_flow
    }

    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.immediate_dominators.get(&block).copied()
    }

    /// Whether `first` dominates `second`.
    pub fn dominates(&self, first: BlockId, second: BlockId) -> bool {
        let Some(entry) = self.control_flow.entry() else {
            return false;
        };
        if first == entry || first == second {
            return true;
        }

        let mut walk = self.immediate_dominator(second);
        while let Some(dominator) = walk {
            if dominator == first {
                return true;
            }
            if dominator == entry {
                return false;
            }
            walk = self.immediate_dominator(dominator);
        }

        false
    }
}

/// Finger intersection over post-order indices.
fn intersect(
    mut first: BlockId,
    mut second: BlockId,
    immediate_dominators: &FnvHashMap<BlockId, BlockId>,
    order_index: &FnvHashMap<BlockId, usize>,
) -> BlockId {
    while first != second {
        while order_index[&first] < order_index[&second] {
            first = immediate_dominators[&first];
        }
        while order_index[&second] < order_index[&first] {
            second = immediate_dominators[&second];
        }
    }
    first
}
