//! The upvalue planner.
//!
//! For every closure this fixes the *upvalue pack*: the ordered list of its
//! captures and the stable index of each. Insertion order is the order; the
//! inverse map serves the backend. A pack is planned even when empty — a
//! closure's runtime representation always has a pack slot, the argument is
//! just null then.
//!
//! The planner also decides where each captured local's cell lives:
//!
//! - **stack-closable** — captured only by immediate children. The cell
//!   sits in the creating frame's closable array and moves to the heap at
//!   scope exit (the relocation protocol).
//! - **heap-promoted** — some capture chain passes through an intermediate
//!   function (an upvalue whose parent is itself an upvalue). Instances of
//!   the inner closure can be created inside frames the declaring function
//!   never sees, so scope-exit sweeps cannot reach them; the cell is
//!   allocated on the heap when the local comes into scope instead, and
//!   every pack entry for it is filled by the creating function.

use std::collections::{HashMap, HashSet};

use crate::ir::{FnId, LocalId, Module, UpvalueId, VarRef};

/// One closure's planned pack.
#[derive(Debug, Default)]
pub struct UpvaluePack {
    /// The captures, in pack order.
    pub variables: Vec<UpvalueId>,
    /// The inverse of `variables`.
    pub variable_ids: HashMap<UpvalueId, usize>,
}

impl UpvaluePack {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn index_of(&self, upvalue: UpvalueId) -> Option<usize> {
        self.variable_ids.get(&upvalue).copied()
    }
}

/// The planner's output, consumed by the code generator.
#[derive(Debug, Default)]
pub struct UpvaluePlan {
    /// One pack per closure function (never for methods or the main
    /// function, which cannot have upvalues).
    pub packs: HashMap<FnId, UpvaluePack>,
    /// Captured locals whose cells are heap-allocated at scope entry.
    pub heap_promoted: HashSet<LocalId>,
}

impl UpvaluePlan {
    pub fn pack(&self, func: FnId) -> Option<&UpvaluePack> {
        self.packs.get(&func)
    }

    pub fn is_heap_promoted(&self, local: LocalId) -> bool {
        self.heap_promoted.contains(&local)
    }

    /// Whether a captured local keeps its cell in the closable array.
    pub fn is_stack_closable(&self, module: &Module, local: LocalId) -> bool {
        !module.local(local).upvalues.is_empty() && !self.is_heap_promoted(local)
    }
}

/// Plan packs and cell placement for every closure in the module.
pub fn plan(module: &Module) -> UpvaluePlan {
    let mut plan = UpvaluePlan::default();

    for fn_id in module.closure_fns() {
        let mut pack = UpvaluePack::default();
        for &upvalue in &module.func(fn_id).upvalues {
            let index = pack.variables.len();
            pack.variables.push(upvalue);
            pack.variable_ids.insert(upvalue, index);
        }
        plan.packs.insert(fn_id, pack);
    }

    // A chain of length two or more means the final local outlives frames
    // the declaring function cannot sweep.
    for (index, upvalue) in module.upvalues.iter().enumerate() {
        if let VarRef::Upvalue(_) = upvalue.parent {
            let local = module.final_target(UpvalueId(index as u32));
            plan.heap_promoted.insert(local);
        }
    }

    plan
}
