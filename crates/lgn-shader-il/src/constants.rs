use fnv::FnvHashMap;

use crate::{ConstantId, IdAllocator, TypeId, ValueId};

/// Interned constant payload. Floating-point values are stored as bit
/// patterns so the map can hash and compare them exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Fp(u64),
    Null,
    Undef,
    Composite(Vec<ConstantId>),
}

/// A constant together with its type and the SSA value it materializes as.
#[derive(Debug, Clone)]
pub struct ConstantEntry {
    pub constant: Constant,
    pub type_id: TypeId,
    pub value: ValueId,
}

/// Interning constant map. Constants are keyed on `(payload, type)`, so the
/// same bit pattern at two types yields two entries.
#[derive(Debug, Default)]
pub struct ConstantMap {
    entries: Vec<ConstantEntry>,
    lookup: FnvHashMap<(Constant, TypeId), ConstantId>,
    by_value: FnvHashMap<ValueId, ConstantId>,
}

impl ConstantMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a constant, allocating a fresh value id the first time it is
    /// seen at this type.
    pub fn get_or_add(
        &mut self,
        constant: Constant,
        type_id: TypeId,
        ids: &mut IdAllocator,
    ) -> ConstantId {
        let key = (constant, type_id);
        if let Some(id) = self.lookup.get(&key) {
            return *id;
        }

        let id = ConstantId(self.entries.len() as u32);
        let value = ids.allocate_value();
        self.entries.push(ConstantEntry {
            constant: key.0.clone(),
            type_id,
            value,
        });
        self.lookup.insert(key, id);
        self.by_value.insert(value, id);
        id
    }

    /// Register a constant parsed from a binary, keeping its original value
    /// id instead of allocating one.
    pub fn add_existing(
        &mut self,
        constant: Constant,
        type_id: TypeId,
        value: ValueId,
    ) -> ConstantId {
        let key = (constant, type_id);
        if let Some(id) = self.lookup.get(&key) {
            return *id;
        }

        let id = ConstantId(self.entries.len() as u32);
        self.entries.push(ConstantEntry {
            constant: key.0.clone(),
            type_id,
            value,
        });
        self.lookup.insert(key, id);
        self.by_value.insert(value, id);
        id
    }

    pub fn entry(&self, id: ConstantId) -> Option<&ConstantEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Look up a constant by payload and type without interning it.
    pub fn find(&self, constant: &Constant, type_id: TypeId) -> Option<ConstantId> {
        self.lookup.get(&(constant.clone(), type_id)).copied()
    }

    /// Look a constant up by the SSA value it materializes as.
    pub fn find_by_value(&self, value: ValueId) -> Option<ConstantId> {
        self.by_value.get(&value).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstantId, &ConstantEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (ConstantId(i as u32), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Type, TypeMap};

    #[test]
    fn test_constant_dedup_per_type() {
        let mut types = TypeMap::new();
        let mut constants = ConstantMap::new();
        let mut ids = IdAllocator::new(1);

        let u32_ty = types.get_or_add(Type::Int {
            bit_width: 32,
            signed: false,
        });
        let i32_ty = types.get_or_add(Type::Int {
            bit_width: 32,
            signed: true,
        });

        let a = constants.get_or_add(Constant::Int(42), u32_ty, &mut ids);
        let b = constants.get_or_add(Constant::Int(42), u32_ty, &mut ids);
        let c = constants.get_or_add(Constant::Int(42), i32_ty, &mut ids);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(constants.len(), 2);

        let value = constants.entry(a).unwrap().value;
        assert_eq!(constants.find_by_value(value), Some(a));
    }
}
