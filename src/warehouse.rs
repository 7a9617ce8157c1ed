//! The versioned variable store. Entries are keyed by variable name, patch
//! and material index, and live in one of two generations: "old", the
//! read-only results of the previous step, and "new", which accumulates the
//! results of the step in progress. Each "new" entry is created once with
//! `put` and afterwards changed only through `modify`.

use core::fmt;
use std::collections::{BTreeMap, HashMap};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::PatchId;
use crate::variable::{Element, ElementKind, Field, FieldView, FieldViewMut, Sizes, Staggering, VarLabel};




#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Generation {
    Old,
    New,
}

impl fmt::Display for Generation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Old => write!(fmt, "old"),
            Generation::New => write!(fmt, "new"),
        }
    }
}




#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarKey {
    pub name: String,
    pub patch: PatchId,
    pub material: usize,
}

impl VarKey {
    pub fn new(name: &str, patch: PatchId, material: usize) -> Self {
        Self { name: name.to_string(), patch, material }
    }
}




/**
 * An entry of a generation, in the shape handed to (and accepted from) the
 * checkpoint subsystem.
 */
pub type Entry = (String, PatchId, usize, Field);




#[derive(Debug, Default)]
pub struct DataWarehouse {
    step: u64,
    labels: HashMap<String, (ElementKind, Staggering)>,
    old: BTreeMap<VarKey, Field>,
    new: BTreeMap<VarKey, Field>,
}




// ============================================================================
impl DataWarehouse {

    pub fn new() -> Self {
        Self::default()
    }

    /**
     * Create an empty store which already knows the type of each of the
     * given labels.
     */
    pub fn with_labels<'a, I>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a VarLabel>,
    {
        let mut dw = Self::new();
        for label in labels {
            dw.record_label(&label.name, label.kind, label.staggering)?;
        }
        Ok(dw)
    }

    /**
     * Rebuild a store from checkpointed entries. The entries populate the
     * "old" generation of the given step; "new" starts empty.
     */
    pub fn restore<I>(step: u64, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut dw = Self { step, ..Self::default() };

        for (name, patch, material, field) in entries {
            dw.record_label(&name, field.kind(), field.staggering())?;
            let key = VarKey { name, patch, material };

            if dw.old.contains_key(&key) {
                return Err(Error::DuplicateVariable { name: key.name, patch, material })
            }
            dw.old.insert(key, field);
        }
        debug!("restored {} entries at step {}", dw.old.len(), step);
        Ok(dw)
    }

    /**
     * Return the index of the step whose results accumulate in "new".
     */
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn len(&self, generation: Generation) -> usize {
        self.generation(generation).len()
    }

    pub fn is_empty(&self) -> bool {
        self.old.is_empty() && self.new.is_empty()
    }

    pub fn contains(&self, name: &str, patch: PatchId, material: usize, generation: Generation) -> bool {
        self.generation(generation).contains_key(&VarKey::new(name, patch, material))
    }

    /**
     * Return a read-only view of an entry. Fails with `VariableNotFound` if
     * the entry does not exist in the given generation, and `TypeMismatch`
     * if `T` or the label's staggering disagree with what is stored.
     */
    pub fn get<T: Element>(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: usize,
        generation: Generation) -> Result<FieldView<'_, T>>
    {
        let field = self.field(&label.name, patch, material, generation)?;
        Self::check_field::<T>(label, field)?;
        field.view::<T>().ok_or_else(|| Self::mismatch(label, field))
    }

    /**
     * Create an entry in the "new" generation. Fails with
     * `DuplicateVariable` if it already exists there.
     */
    pub fn put(&mut self, label: &VarLabel, patch: PatchId, material: usize, field: Field) -> Result<()> {
        if !field.matches(label) {
            return Err(Self::mismatch(label, &field))
        }
        self.record_label(&label.name, label.kind, label.staggering)?;

        let key = VarKey::new(&label.name, patch, material);

        if self.new.contains_key(&key) {
            return Err(Error::DuplicateVariable { name: key.name, patch, material })
        }
        debug!("put {} on patch {} material {}", label.name, patch, material);
        self.new.insert(key, field);
        Ok(())
    }

    /**
     * Return a mutable view of an existing "new" entry.
     */
    pub fn modify<T: Element>(&mut self, label: &VarLabel, patch: PatchId, material: usize) -> Result<FieldViewMut<'_, T>> {
        let field = self.field_mut(&label.name, patch, material, Generation::New)?;
        Self::check_field::<T>(label, field)?;
        field.view_mut::<T>().ok_or_else(|| Error::TypeMismatch {
            name: label.name.clone(),
            expected: VarLabel::describe(T::KIND, label.staggering),
            found: String::new(),
        })
    }

    /**
     * Return the logical and storage extents of an entry. The "new"
     * generation is consulted first, then "old".
     */
    pub fn sizes(&self, name: &str, patch: PatchId, material: usize) -> Result<Sizes> {
        let key = VarKey::new(name, patch, material);
        self.new
            .get(&key)
            .or_else(|| self.old.get(&key))
            .map(Field::sizes)
            .ok_or(Error::VariableNotFound {
                name: key.name,
                patch,
                material,
                generation: Generation::New,
            })
    }

    /**
     * Copy an "old" entry into "new" unchanged.
     */
    pub fn transfer_from_old(&mut self, label: &VarLabel, patch: PatchId, material: usize) -> Result<()> {
        let field = self.field(&label.name, patch, material, Generation::Old)?.clone();
        self.put(label, patch, material, field)
    }

    /**
     * Promote "new" to "old" and start an empty "new" generation for the
     * next step. The previous "old" generation is dropped.
     */
    pub fn advance(&mut self) {
        debug!(
            "promoting {} entries at the end of step {} (dropping {})",
            self.new.len(),
            self.step,
            self.old.len()
        );
        self.old = std::mem::take(&mut self.new);
        self.step += 1;
    }

    /**
     * Iterate over the "old" generation, in key order, for checkpointing.
     */
    pub fn old_entries(&self) -> impl Iterator<Item = (&str, PatchId, usize, &Field)> {
        self.old.iter().map(|(key, field)| (key.name.as_str(), key.patch, key.material, field))
    }

    /**
     * Clone the "old" generation into owned checkpoint entries.
     */
    pub fn checkpoint(&self) -> Vec<Entry> {
        self.old_entries()
            .map(|(name, patch, material, field)| (name.to_string(), patch, material, field.clone()))
            .collect()
    }

    /**
     * Return the untyped entry, for the ghost exchange layer.
     */
    pub fn field(&self, name: &str, patch: PatchId, material: usize, generation: Generation) -> Result<&Field> {
        let key = VarKey::new(name, patch, material);
        match self.generation(generation).get(&key) {
            Some(field) => Ok(field),
            None => Err(Error::VariableNotFound { name: key.name, patch, material, generation }),
        }
    }

    pub(crate) fn field_mut(&mut self, name: &str, patch: PatchId, material: usize, generation: Generation) -> Result<&mut Field> {
        let key = VarKey::new(name, patch, material);
        let entries = match generation {
            Generation::Old => &mut self.old,
            Generation::New => &mut self.new,
        };
        match entries.get_mut(&key) {
            Some(field) => Ok(field),
            None => Err(Error::VariableNotFound { name: key.name, patch, material, generation }),
        }
    }

    fn generation(&self, generation: Generation) -> &BTreeMap<VarKey, Field> {
        match generation {
            Generation::Old => &self.old,
            Generation::New => &self.new,
        }
    }

    fn record_label(&mut self, name: &str, kind: ElementKind, staggering: Staggering) -> Result<()> {
        match self.labels.get(name) {
            Some(&(k, s)) if (k, s) != (kind, staggering) => Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: VarLabel::describe(k, s),
                found: VarLabel::describe(kind, staggering),
            }),
            Some(_) => Ok(()),
            None => {
                self.labels.insert(name.to_string(), (kind, staggering));
                Ok(())
            }
        }
    }

    fn check_field<T: Element>(label: &VarLabel, field: &Field) -> Result<()> {
        if T::KIND != label.kind || !field.matches(label) {
            Err(Error::TypeMismatch {
                name: label.name.clone(),
                expected: VarLabel::describe(T::KIND, label.staggering),
                found: field.describe(),
            })
        } else {
            Ok(())
        }
    }

    fn mismatch(label: &VarLabel, field: &Field) -> Error {
        Error::TypeMismatch {
            name: label.name.clone(),
            expected: VarLabel::describe(label.kind, label.staggering),
            found: field.describe(),
        }
    }
}
