//! The battery element tree: single cells and composite packs.

use crate::notify::{Notifier, SubscriptionId, ValueChanged};
use crate::reading::{keys, ReadingKey, ReadingSource, ReadingStore, ReadingValue};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// Identity of a battery element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProductDefinition {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub chemistry: Option<String>,
    pub serial_number: Option<String>,
    pub manufacture_date: Option<String>,
    pub cell_count: usize,
}

impl ProductDefinition {
    /// Reads the identity slice of `store`. Missing or empty readings map to `None`.
    pub fn from_store(store: &ReadingStore, cell_count: usize) -> Self {
        let text = |key: &ReadingKey| -> Option<String> {
            match store.get(key) {
                Ok(ReadingValue::Text(text)) if !text.is_empty() => Some(text),
                _ => None,
            }
        };
        Self {
            manufacturer: text(&keys::MANUFACTURER),
            product: text(&keys::PRODUCT),
            chemistry: text(&keys::CHEMISTRY),
            serial_number: text(&keys::SERIAL_NUMBER),
            manufacture_date: text(&keys::MANUFACTURE_DATE),
            cell_count,
        }
    }

    /// Fills fields missing in `self` with values all `parts` agree on.
    fn merge_common(mut self, parts: &[ProductDefinition]) -> Self {
        fn common<'a>(mut values: impl Iterator<Item = &'a Option<String>>) -> Option<String> {
            let first = values.next()?.clone()?;
            values
                .all(|value| value.as_deref() == Some(first.as_str()))
                .then_some(first)
        }
        self.manufacturer = self
            .manufacturer
            .or_else(|| common(parts.iter().map(|p| &p.manufacturer)));
        self.product = self
            .product
            .or_else(|| common(parts.iter().map(|p| &p.product)));
        self.chemistry = self
            .chemistry
            .or_else(|| common(parts.iter().map(|p| &p.chemistry)));
        self.manufacture_date = self
            .manufacture_date
            .or_else(|| common(parts.iter().map(|p| &p.manufacture_date)));
        self
    }
}

/// A node of the telemetry tree.
pub trait BatteryElement: Send + Sync + fmt::Debug {
    fn readings(&self) -> &ReadingStore;

    fn notifier(&self) -> &Arc<Notifier>;

    fn product(&self) -> ProductDefinition;

    /// Direct children, in physical order. Empty for a single cell.
    fn sub_elements(&self) -> Vec<Arc<dyn BatteryElement>> {
        Vec::new()
    }

    fn subscribe(&self, callback: Box<dyn Fn(&ValueChanged) + Send + Sync>) -> SubscriptionId {
        self.notifier().subscribe(callback)
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<ValueChanged> {
        self.notifier().watch()
    }
}

/// A single cell. Its readings are written directly by a protocol adapter.
pub struct SingleCell {
    notifier: Arc<Notifier>,
    readings: ReadingStore,
}

impl SingleCell {
    pub fn new() -> Self {
        let notifier = Arc::new(Notifier::default());
        let readings = ReadingStore::new(notifier.clone());
        for key in [keys::VOLTAGE, keys::TEMPERATURE]
            .into_iter()
            .chain(keys::PRODUCT_KEYS)
        {
            // A fresh store cannot hold duplicates.
            let _ = readings.create_slot(key);
        }
        Self { notifier, readings }
    }

    pub fn voltage(&self) -> Result<f32> {
        float(&self.readings, &keys::VOLTAGE)
    }
}

impl Default for SingleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryElement for SingleCell {
    fn readings(&self) -> &ReadingStore {
        &self.readings
    }

    fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    fn product(&self) -> ProductDefinition {
        ProductDefinition::from_store(&self.readings, 1)
    }
}

impl fmt::Debug for SingleCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleCell")
            .field("readings", &self.readings)
            .finish()
    }
}

struct Member {
    element: Arc<dyn BatteryElement>,
    forwarding: SubscriptionId,
}

/// The current children of a pack. Shared with the pack's aggregating readings.
struct Members {
    elements: RwLock<Vec<Member>>,
}

impl Members {
    fn elements(&self) -> Vec<Arc<dyn BatteryElement>> {
        self.elements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|member| member.element.clone())
            .collect()
    }
}

impl ReadingSource for Members {
    fn values_of(&self, key: &ReadingKey) -> Result<Vec<ReadingValue>> {
        self.elements()
            .iter()
            .filter(|element| element.readings().contains(key))
            .map(|element| element.readings().get(key))
            .collect()
    }
}

impl Drop for Members {
    fn drop(&mut self) {
        let elements = self
            .elements
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for member in elements.drain(..) {
            member.element.notifier().unsubscribe(member.forwarding);
        }
    }
}

/// A composite element owning an ordered, non-empty list of children.
///
/// Every child's value-changed events are re-raised on the pack, so an observer of the root
/// sees all mutations below it.
pub struct BatteryPack {
    notifier: Arc<Notifier>,
    readings: ReadingStore,
    members: Arc<Members>,
}

impl BatteryPack {
    pub fn new(sub_elements: Vec<Arc<dyn BatteryElement>>) -> Result<Self> {
        if sub_elements.is_empty() {
            return Err(Error::EmptyChildSet);
        }
        let notifier = Arc::new(Notifier::default());
        let members = sub_elements
            .into_iter()
            .map(|element| Member {
                forwarding: element.notifier().forward_to(&notifier),
                element,
            })
            .collect();
        Ok(Self {
            readings: ReadingStore::new(notifier.clone()),
            notifier,
            members: Arc::new(Members {
                elements: RwLock::new(members),
            }),
        })
    }

    /// Number of leaf cells below this pack.
    pub fn cell_count(&self) -> usize {
        self.members
            .elements()
            .iter()
            .map(|element| element.product().cell_count)
            .sum()
    }

    pub fn add_element(&self, element: Arc<dyn BatteryElement>) {
        let forwarding = element.notifier().forward_to(&self.notifier);
        self.members
            .elements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Member {
                element,
                forwarding,
            });
    }

    /// Detaches `element` and stops forwarding its events. A pack is never left empty.
    pub fn remove_element(&self, element: &Arc<dyn BatteryElement>) -> Result<()> {
        let mut elements = self
            .members
            .elements
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let position = elements
            .iter()
            .position(|member| Arc::ptr_eq(&member.element, element))
            .ok_or_else(|| {
                Error::PreconditionViolation("element is not part of this pack".to_string())
            })?;
        if elements.len() == 1 {
            return Err(Error::EmptyChildSet);
        }
        let member = elements.remove(position);
        member.element.notifier().unsubscribe(member.forwarding);
        Ok(())
    }

    /// Registers `target` as the sum of `source` over the current children.
    pub fn create_sum_value(&self, target: ReadingKey, source: ReadingKey) -> Result<()> {
        self.readings
            .create_sum_value(target, source, self.members.clone())
    }
}

impl BatteryElement for BatteryPack {
    fn readings(&self) -> &ReadingStore {
        &self.readings
    }

    fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Identity recorded on the pack itself, completed with what all children agree on.
    fn product(&self) -> ProductDefinition {
        let parts: Vec<_> = self
            .members
            .elements()
            .iter()
            .map(|element| element.product())
            .collect();
        let cell_count = parts.iter().map(|part| part.cell_count).sum();
        ProductDefinition::from_store(&self.readings, cell_count).merge_common(&parts)
    }

    fn sub_elements(&self) -> Vec<Arc<dyn BatteryElement>> {
        self.members.elements()
    }
}

impl fmt::Debug for BatteryPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatteryPack")
            .field("readings", &self.readings)
            .field("sub_elements", &self.members.elements())
            .finish()
    }
}

/// Serialisable view of an element and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct ElementSnapshot {
    pub product: ProductDefinition,
    pub readings: BTreeMap<String, ReadingValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_elements: Vec<ElementSnapshot>,
}

impl ElementSnapshot {
    pub fn of(element: &dyn BatteryElement) -> Self {
        Self {
            product: element.product(),
            readings: element
                .readings()
                .snapshot()
                .into_iter()
                .map(|(key, value)| (key.name().to_owned(), value))
                .collect(),
            sub_elements: element
                .sub_elements()
                .iter()
                .map(|child| ElementSnapshot::of(child.as_ref()))
                .collect(),
        }
    }
}

pub(crate) fn float(store: &ReadingStore, key: &ReadingKey) -> Result<f32> {
    store
        .get(key)?
        .as_f32()
        .ok_or_else(|| Error::InvalidReading(format!("'{key}' is not numeric")))
}
