use fnv::FnvHashMap;

use crate::TypeId;

/// Pointer address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Function,
    Private,
    Uniform,
    Storage,
    Workgroup,
    Input,
    Output,
    /// Address space the codec does not model, preserved by raw value.
    Unexposed(u32),
}

/// Interned type. Composite types reference their element types by id, so
/// structural equality on the variant is structural equality on the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int { bit_width: u8, signed: bool },
    Fp { bit_width: u8 },
    Pointer { pointee: TypeId, address_space: AddressSpace },
    Vector { component: TypeId, component_count: u8 },
    Matrix { column: TypeId, column_count: u8 },
    Array { element: TypeId, count: u32 },
    Struct { members: Vec<TypeId> },
    Function { return_type: TypeId, parameters: Vec<TypeId> },
    Texture,
    Buffer,
    Sampler,
    /// Type the codec does not model, preserved verbatim.
    Unexposed { words: Vec<u32> },
}

/// Structurally interning type map.
#[derive(Debug, Default)]
pub struct TypeMap {
    types: Vec<Type>,
    lookup: FnvHashMap<Type, TypeId>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a type, returning the existing id on a structural match.
    pub fn get_or_add(&mut self, ty: Type) -> TypeId {
        if let Some(id) = self.lookup.get(&ty) {
            return *id;
        }

        let id = TypeId(self.types.len() as u32);
        self.lookup.insert(ty.clone(), id);
        self.types.push(ty);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, ty)| (TypeId(i as u32), ty))
    }

    /// Whether the type is floating-point at component granularity, i.e. a
    /// scalar fp or a vector of fp components.
    pub fn is_fp_component(&self, id: TypeId) -> bool {
        match self.get(id) {
            Some(Type::Fp { .. }) => true,
            Some(Type::Vector { component, .. }) => {
                matches!(self.get(*component), Some(Type::Fp { .. }))
            }
            _ => false,
        }
    }

    /// Whether the type is a matrix.
    pub fn is_matrix(&self, id: TypeId) -> bool {
        matches!(self.get(id), Some(Type::Matrix { .. }))
    }
}
