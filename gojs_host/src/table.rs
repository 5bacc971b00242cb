use crate::*;
use fxhash::*;

/// Upper word of every boxed reference. The low bits carry the type flag.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

/// The reference of the not-a-number constant.
pub const NAN_REF: u32 = 0;
/// The reference of the number zero.
pub const ZERO_REF: u32 = 1;
/// The reference of null.
pub const NULL_REF: u32 = 2;
/// The reference of true.
pub const TRUE_REF: u32 = 3;
/// The reference of false.
pub const FALSE_REF: u32 = 4;
/// The reference of the global object.
pub const GLOBAL_REF: u32 = 5;
/// The reference of the execution driver object.
pub const BRIDGE_REF: u32 = 6;
/// The number of slots that exist for the table's whole lifetime.
pub const RESERVED_REFS: u32 = 7;

/// How many guest-held copies of a reference are alive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefCount {
    /// A reserved constant that is never recycled.
    Pinned,
    /// A dynamically registered value.
    Counted(u32)
}

/// One occupied table slot.
#[derive(Clone, Debug)]
struct Slot {
    /// The host value.
    value: Value,
    /// The number of outstanding guest copies.
    count: RefCount
}

/// Maps host values to the small integer references the guest embeds in
/// NaN-boxed doubles. Slots are recycled through a free list once the
/// guest finalizes every copy of a reference.
#[derive(Clone, Debug)]
pub struct ValueTable {
    /// Live and vacant slots, indexed by reference.
    slots: Vec<Option<Slot>>,
    /// The canonical reference of each registered value.
    ids: FxHashMap<ValueKey, u32>,
    /// Vacant references, reused last-in first-out.
    free: Vec<u32>
}

impl ValueTable {
    /// Creates a table holding only the reserved constants.
    pub fn new() -> Self {
        let constants = [
            Value::Number(f64::NAN),
            Value::Number(0.0),
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Host(HostObject::Global),
            Value::Host(HostObject::Bridge)
        ];

        let mut ids = FxHashMap::default();
        for (id, value) in constants.iter().enumerate().skip(ZERO_REF as usize) {
            if let Some(key) = value.key() {
                ids.insert(key, id as u32);
            }
        }

        Self {
            slots: constants.into_iter().map(|value| Some(Slot { value, count: RefCount::Pinned })).collect(),
            ids,
            free: Vec::new()
        }
    }

    /// Registers `value` and returns the eight bytes the guest expects to
    /// find for it. Non-zero numbers are stored inline; undefined is zero.
    pub fn store(&mut self, value: Value) -> u64 {
        match value {
            Value::Undefined => 0,
            Value::Number(x) if x.is_nan() => ((NAN_HEAD as u64) << 32) | NAN_REF as u64,
            Value::Number(x) if x != 0.0 => x.to_bits(),
            value => {
                let flag = value.type_flag();
                let id = self.intern(value);
                (((NAN_HEAD | flag) as u64) << 32) | id as u64
            }
        }
    }

    /// Decodes eight bytes read from guest memory back into a host value.
    pub fn load(&self, bits: u64) -> Result<Value, GuestError> {
        let number = f64::from_bits(bits);
        if number == 0.0 {
            Ok(Value::Undefined)
        }
        else if !number.is_nan() {
            Ok(Value::Number(number))
        }
        else {
            let id = bits as u32;
            self.get(id).cloned().ok_or_else(|| GuestError::ProtocolMismatch(format!("Reference {id} is not live")))
        }
    }

    /// Releases one guest copy of `id`. When no copies remain the value
    /// loses its canonical entry and the slot returns to the free list.
    pub fn drop_ref(&mut self, id: u32) -> Result<(), GuestError> {
        let slot = self.slots.get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| GuestError::ProtocolMismatch(format!("Finalized reference {id} is not live")))?;

        match &mut slot.count {
            RefCount::Pinned => return Ok(()),
            RefCount::Counted(count) => {
                *count = count.saturating_sub(1);
                if *count > 0 {
                    return Ok(());
                }
            }
        }

        if let Some(slot) = self.slots[id as usize].take() {
            if let Some(key) = slot.value.key() {
                if self.ids.get(&key) == Some(&id) {
                    self.ids.remove(&key);
                }
            }
        }

        self.free.push(id);
        Ok(())
    }

    /// The value currently held by `id`.
    pub fn get(&self, id: u32) -> Option<&Value> {
        self.slots.get(id as usize).and_then(Option::as_ref).map(|x| &x.value)
    }

    /// The reference count of `id`, if it is live.
    pub fn ref_count(&self, id: u32) -> Option<RefCount> {
        self.slots.get(id as usize).and_then(Option::as_ref).map(|x| x.count)
    }

    /// The canonical reference of `value`, if it has one.
    pub fn id_of(&self, value: &Value) -> Option<u32> {
        value.key().and_then(|key| self.ids.get(&key).copied())
    }

    /// The number of live slots, constants included.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|x| x.is_some()).count()
    }

    /// Finds or allocates the slot for `value` and counts one more guest copy.
    fn intern(&mut self, value: Value) -> u32 {
        let key = value.key();
        let id = match key.as_ref().and_then(|key| self.ids.get(key)).copied() {
            Some(id) => id,
            None => {
                let id = self.free.pop().unwrap_or(self.slots.len() as u32);
                let slot = Some(Slot { value, count: RefCount::Counted(0) });
                if id as usize == self.slots.len() {
                    self.slots.push(slot);
                }
                else {
                    self.slots[id as usize] = slot;
                }

                if let Some(key) = key {
                    self.ids.entry(key).or_insert(id);
                }

                id
            }
        };

        if let Some(Slot { count: RefCount::Counted(count), .. }) = &mut self.slots[id as usize] {
            *count += 1;
        }

        id
    }
}

impl Default for ValueTable {
    fn default() -> Self {
        Self::new()
    }
}
