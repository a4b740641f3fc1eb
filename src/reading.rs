//! Named, typed measurement values kept per battery element.
//!
//! A [`ReadingStore`] maps reading names to holders. A holder is either a primitive value
//! written by a protocol adapter, or a derivation evaluated from other readings each time it
//! is read, so a derived value is never stale relative to its inputs.

use crate::notify::{Notifier, ValueChanged};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Float,
    Integer,
    Text,
}

impl ValueType {
    pub fn zero(self) -> ReadingValue {
        match self {
            ValueType::Float => ReadingValue::Float(0.0),
            ValueType::Integer => ReadingValue::Integer(0),
            ValueType::Text => ReadingValue::Text(String::new()),
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Integer)
    }
}

/// Identifies a reading by name and declares the type of its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadingKey {
    name: Cow<'static, str>,
    value_type: ValueType,
}

impl ReadingKey {
    pub const fn new(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name: Cow::Borrowed(name),
            value_type,
        }
    }

    pub fn custom(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            value_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Float(f32),
    Integer(i64),
    Text(String),
}

impl ReadingValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ReadingValue::Float(_) => ValueType::Float,
            ReadingValue::Integer(_) => ValueType::Integer,
            ReadingValue::Text(_) => ValueType::Text,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ReadingValue::Float(v) => Some(*v),
            ReadingValue::Integer(v) => Some(*v as f32),
            ReadingValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ReadingValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReadingValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Float(v) => write!(f, "{v:.3}"),
            ReadingValue::Integer(v) => write!(f, "{v}"),
            ReadingValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f32> for ReadingValue {
    fn from(value: f32) -> Self {
        ReadingValue::Float(value)
    }
}

impl From<i64> for ReadingValue {
    fn from(value: i64) -> Self {
        ReadingValue::Integer(value)
    }
}

impl From<String> for ReadingValue {
    fn from(value: String) -> Self {
        ReadingValue::Text(value)
    }
}

impl From<&str> for ReadingValue {
    fn from(value: &str) -> Self {
        ReadingValue::Text(value.to_owned())
    }
}

/// Well known readings shared by cells, packs and protocol adapters.
pub mod keys {
    use super::{ReadingKey, ValueType};

    pub const VOLTAGE: ReadingKey = ReadingKey::new("Voltage", ValueType::Float);
    pub const CURRENT: ReadingKey = ReadingKey::new("Current", ValueType::Float);
    pub const AVERAGE_CURRENT: ReadingKey = ReadingKey::new("AverageCurrent", ValueType::Float);
    pub const TEMPERATURE: ReadingKey = ReadingKey::new("Temperature", ValueType::Float);
    pub const RELATIVE_STATE_OF_CHARGE: ReadingKey =
        ReadingKey::new("RelativeStateOfCharge", ValueType::Float);
    pub const ABSOLUTE_STATE_OF_CHARGE: ReadingKey =
        ReadingKey::new("AbsoluteStateOfCharge", ValueType::Float);
    pub const REMAINING_CAPACITY: ReadingKey =
        ReadingKey::new("RemainingCapacity", ValueType::Float);
    pub const FULL_CHARGE_CAPACITY: ReadingKey =
        ReadingKey::new("FullChargeCapacity", ValueType::Float);
    pub const CYCLE_COUNT: ReadingKey = ReadingKey::new("CycleCount", ValueType::Integer);
    pub const DESIGN_VOLTAGE: ReadingKey = ReadingKey::new("DesignVoltage", ValueType::Float);
    pub const DESIGN_CAPACITY: ReadingKey = ReadingKey::new("DesignCapacity", ValueType::Float);
    pub const SUM_OF_CELL_VOLTAGES: ReadingKey =
        ReadingKey::new("SumOfCellVoltages", ValueType::Float);

    pub const MANUFACTURER: ReadingKey = ReadingKey::new("Manufacturer", ValueType::Text);
    pub const PRODUCT: ReadingKey = ReadingKey::new("Product", ValueType::Text);
    pub const CHEMISTRY: ReadingKey = ReadingKey::new("Chemistry", ValueType::Text);
    pub const SERIAL_NUMBER: ReadingKey = ReadingKey::new("SerialNumber", ValueType::Text);
    pub const MANUFACTURE_DATE: ReadingKey = ReadingKey::new("ManufactureDate", ValueType::Text);

    /// The identity slice of a store, see [`crate::battery::ProductDefinition`].
    pub const PRODUCT_KEYS: [ReadingKey; 5] = [
        MANUFACTURER,
        PRODUCT,
        CHEMISTRY,
        SERIAL_NUMBER,
        MANUFACTURE_DATE,
    ];
}

/// Yields the current values of a reading across a dynamic set of stores.
///
/// Aggregating holders ask their source on every read, so members added or removed after
/// the holder was created are accounted for.
pub trait ReadingSource: Send + Sync {
    /// Values of `key` for every member that registers it, in member order.
    fn values_of(&self, key: &ReadingKey) -> Result<Vec<ReadingValue>>;
}

type Compute = dyn Fn(&[ReadingValue]) -> ReadingValue + Send + Sync;

/// A derivation over readings of the same store.
#[derive(Clone)]
pub struct Derivation {
    inputs: Vec<ReadingKey>,
    compute: Arc<Compute>,
}

impl Derivation {
    pub fn new<F>(inputs: Vec<ReadingKey>, compute: F) -> Self
    where
        F: Fn(&[ReadingValue]) -> ReadingValue + Send + Sync + 'static,
    {
        Self {
            inputs,
            compute: Arc::new(compute),
        }
    }

    pub fn inputs(&self) -> &[ReadingKey] {
        &self.inputs
    }
}

/// How a reading obtains its value.
#[derive(Clone)]
pub enum Holder {
    Primitive(ReadingValue),
    Derived(Derivation),
    /// Arithmetic sum of `source` across the members of a [`ReadingSource`].
    Sum {
        source: ReadingKey,
        members: Arc<dyn ReadingSource>,
    },
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Primitive(value) => f.debug_tuple("Primitive").field(value).finish(),
            Holder::Derived(derivation) => f
                .debug_struct("Derived")
                .field("inputs", &derivation.inputs)
                .finish_non_exhaustive(),
            Holder::Sum { source, .. } => f
                .debug_struct("Sum")
                .field("source", source)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: ReadingKey,
    holder: Holder,
}

/// Per element map of readings. Every successful [`ReadingStore::set`] is announced on the
/// owning element's notifier.
pub struct ReadingStore {
    entries: RwLock<HashMap<String, Entry>>,
    notifier: Arc<Notifier>,
}

impl ReadingStore {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub fn create_value(&self, key: ReadingKey, holder: Holder) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(key.name()) {
            return Err(Error::DuplicateKey(key));
        }
        match &holder {
            Holder::Primitive(value) => check_type(&key, value)?,
            Holder::Derived(derivation) => {
                for input in derivation.inputs() {
                    match entries.get(input.name()) {
                        Some(entry) if entry.key.value_type() == input.value_type() => {}
                        Some(entry) => {
                            return Err(Error::TypeMismatch {
                                key: input.clone(),
                                expected: entry.key.value_type(),
                                found: input.value_type(),
                            })
                        }
                        None => return Err(Error::UnknownKey(input.clone())),
                    }
                }
            }
            Holder::Sum { source, .. } => {
                if !source.value_type().is_numeric() || source.value_type() != key.value_type() {
                    return Err(Error::TypeMismatch {
                        expected: key.value_type(),
                        found: source.value_type(),
                        key,
                    });
                }
            }
        }
        log::trace!("create reading '{key}' as {holder:?}");
        entries.insert(key.name().to_owned(), Entry { key, holder });
        Ok(())
    }

    /// Registers a primitive reading initialised to the zero value of its type.
    pub fn create_slot(&self, key: ReadingKey) -> Result<()> {
        let zero = key.value_type().zero();
        self.create_value(key, Holder::Primitive(zero))
    }

    pub fn create_sum_value(
        &self,
        target: ReadingKey,
        source: ReadingKey,
        members: Arc<dyn ReadingSource>,
    ) -> Result<()> {
        self.create_value(target, Holder::Sum { source, members })
    }

    pub fn contains(&self, key: &ReadingKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.name())
            .is_some_and(|entry| entry.key.value_type() == key.value_type())
    }

    pub fn keys(&self) -> Vec<ReadingKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = entries.values().map(|entry| entry.key.clone()).collect();
        keys.sort_by(|a, b| a.name().cmp(b.name()));
        keys
    }

    fn entry(&self, key: &ReadingKey) -> Result<Entry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(key.name())
            .ok_or_else(|| Error::UnknownKey(key.clone()))?;
        if entry.key.value_type() != key.value_type() {
            return Err(Error::TypeMismatch {
                key: key.clone(),
                expected: entry.key.value_type(),
                found: key.value_type(),
            });
        }
        Ok(entry.clone())
    }

    pub fn get(&self, key: &ReadingKey) -> Result<ReadingValue> {
        // The lock is released before evaluating, derivations read other entries.
        let entry = self.entry(key)?;
        match entry.holder {
            Holder::Primitive(value) => Ok(value),
            Holder::Derived(derivation) => {
                let inputs = derivation
                    .inputs
                    .iter()
                    .map(|input| self.get(input))
                    .collect::<Result<Vec<_>>>()?;
                let value = (derivation.compute)(&inputs);
                check_type(&entry.key, &value)?;
                Ok(value)
            }
            Holder::Sum { source, members } => sum(&entry.key, &members.values_of(&source)?),
        }
    }

    pub fn set(&self, key: &ReadingKey, value: ReadingValue) -> Result<()> {
        check_type(key, &value)?;
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let entry = entries
                .get_mut(key.name())
                .ok_or_else(|| Error::UnknownKey(key.clone()))?;
            check_type(&entry.key, &value)?;
            match &mut entry.holder {
                Holder::Primitive(current) => *current = value.clone(),
                _ => return Err(Error::NotPrimitive(key.clone())),
            }
        }
        self.notifier.raise(&ValueChanged {
            key: key.clone(),
            value,
        });
        Ok(())
    }

    /// Current values of every reading, sorted by name. Readings that fail to evaluate are
    /// left out.
    pub fn snapshot(&self) -> Vec<(ReadingKey, ReadingValue)> {
        self.keys()
            .into_iter()
            .filter_map(|key| match self.get(&key) {
                Ok(value) => Some((key, value)),
                Err(err) => {
                    log::debug!("skip reading '{key}' in snapshot ({err})");
                    None
                }
            })
            .collect()
    }
}

impl fmt::Debug for ReadingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadingStore")
            .field("keys", &self.keys())
            .finish()
    }
}

fn check_type(key: &ReadingKey, value: &ReadingValue) -> Result<()> {
    if key.value_type() != value.value_type() {
        return Err(Error::TypeMismatch {
            key: key.clone(),
            expected: key.value_type(),
            found: value.value_type(),
        });
    }
    Ok(())
}

fn sum(key: &ReadingKey, values: &[ReadingValue]) -> Result<ReadingValue> {
    let mut total = key.value_type().zero();
    for value in values {
        total = match (total, value) {
            (ReadingValue::Float(a), ReadingValue::Float(b)) => ReadingValue::Float(a + b),
            (ReadingValue::Integer(a), ReadingValue::Integer(b)) => {
                ReadingValue::Integer(a.wrapping_add(*b))
            }
            (_, other) => {
                return Err(Error::TypeMismatch {
                    key: key.clone(),
                    expected: key.value_type(),
                    found: other.value_type(),
                })
            }
        };
    }
    Ok(total)
}
