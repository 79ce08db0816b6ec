//! Typed, SSA-like intermediate representation shared between the shader
//! binary codecs.
//!
//! A [`Program`] owns interned type and constant maps, a set of functions
//! made of basic blocks, and the id space the values and blocks live in.
//! Instructions are tagged variants ([`Op`]) rather than a polymorphic
//! hierarchy, so feature injectors pattern-match and the codecs emit with
//! per-variant constructors.
//!
//! Every instruction carries a [`SourceSpan`] pointing back at the original
//! binary position, which is what diagnostic symbolization resolves through
//! [`Program::traceback`].

mod analysis;
mod block;
mod constants;
mod emitter;
mod function;
mod id;
mod instruction;
mod program;
mod types;

pub use analysis::{ControlFlow, DominatorTree};
pub use block::{BasicBlock, BlockFlags};
pub use constants::{Constant, ConstantEntry, ConstantMap};
pub use emitter::Emitter;
pub use function::Function;
pub use id::{BlockId, ConstantId, FunctionId, IdAllocator, TypeId, ValueId};
pub use instruction::{
    AtomicOp, BinaryOp, Instruction, KernelValue, Op, SourceSpan, UnaryOp, INVALID_CODE_OFFSET,
};
pub use program::{Program, Traceback};
pub use types::{AddressSpace, Type, TypeMap};
