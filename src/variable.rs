use core::fmt;
use serde::{Deserialize, Serialize};

use crate::ghost;
use crate::index_space::{range3d, Axis, IndexSpace};




/**
 * Where a variable's values live relative to the cells of a patch.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Staggering {
    Cell,
    FaceX,
    FaceY,
    FaceZ,
    Node,
    Particle,
}

impl Staggering {

    /**
     * Return the index space of the values for a patch covering the given
     * cells. Face variables have one extra layer on the upper side of their
     * axis, node variables one extra layer on every axis. Particle variables
     * are not tied to the cell index space, and `None` is returned.
     */
    pub fn logical_space(&self, cells: &IndexSpace) -> Option<IndexSpace> {
        match self {
            Staggering::Cell => Some(cells.clone()),
            Staggering::FaceX => Some(cells.extend_upper(1, Axis::I)),
            Staggering::FaceY => Some(cells.extend_upper(1, Axis::J)),
            Staggering::FaceZ => Some(cells.extend_upper(1, Axis::K)),
            Staggering::Node => Some(cells
                .extend_upper(1, Axis::I)
                .extend_upper(1, Axis::J)
                .extend_upper(1, Axis::K)),
            Staggering::Particle => None,
        }
    }

    /**
     * Whether values with this staggering can be padded with ghost layers.
     */
    pub fn has_ghosts(&self) -> bool {
        *self != Staggering::Particle
    }
}




/**
 * The element types a variable may hold.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    F64,
    F32,
    I64,
    I32,
}

impl ElementKind {
    pub fn size(&self) -> usize {
        match self {
            ElementKind::F64 | ElementKind::I64 => 8,
            ElementKind::F32 | ElementKind::I32 => 4,
        }
    }
}




/**
 * Type-erased storage for the values of one variable on one patch.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
}

impl Buffer {
    pub fn kind(&self) -> ElementKind {
        match self {
            Buffer::F64(_) => ElementKind::F64,
            Buffer::F32(_) => ElementKind::F32,
            Buffer::I64(_) => ElementKind::I64,
            Buffer::I32(_) => ElementKind::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F64(v) => v.len(),
            Buffer::F32(v) => v.len(),
            Buffer::I64(v) => v.len(),
            Buffer::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Buffer::F64(v) => bytemuck::cast_slice(v.as_slice()),
            Buffer::F32(v) => bytemuck::cast_slice(v.as_slice()),
            Buffer::I64(v) => bytemuck::cast_slice(v.as_slice()),
            Buffer::I32(v) => bytemuck::cast_slice(v.as_slice()),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Buffer::F64(v) => bytemuck::cast_slice_mut(v.as_mut_slice()),
            Buffer::F32(v) => bytemuck::cast_slice_mut(v.as_mut_slice()),
            Buffer::I64(v) => bytemuck::cast_slice_mut(v.as_mut_slice()),
            Buffer::I32(v) => bytemuck::cast_slice_mut(v.as_mut_slice()),
        }
    }

    fn zeros(kind: ElementKind, len: usize) -> Self {
        match kind {
            ElementKind::F64 => Buffer::F64(vec![0.0; len]),
            ElementKind::F32 => Buffer::F32(vec![0.0; len]),
            ElementKind::I64 => Buffer::I64(vec![0; len]),
            ElementKind::I32 => Buffer::I32(vec![0; len]),
        }
    }
}




mod sealed {
    pub trait Sealed {}
}

/**
 * Plain-old-data element types which can be stored in a [`Field`].
 */
pub trait Element: bytemuck::Pod + Default + fmt::Debug + Send + Sync + sealed::Sealed {
    const KIND: ElementKind;

    fn slice(buffer: &Buffer) -> Option<&[Self]>;

    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;

    fn wrap(data: Vec<Self>) -> Buffer;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl sealed::Sealed for $t {}

        impl Element for $t {
            const KIND: ElementKind = ElementKind::$variant;

            fn slice(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn wrap(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }
        }
    };
}

impl_element!(f64, F64);
impl_element!(f32, F32);
impl_element!(i64, I64);
impl_element!(i32, I32);




/**
 * The name, element type and staggering of a variable. A name keeps the
 * same type and staggering for the whole run.
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarLabel {
    pub name: String,
    pub kind: ElementKind,
    pub staggering: Staggering,
}

impl VarLabel {
    pub fn new<T: Element>(name: &str, staggering: Staggering) -> Self {
        Self { name: name.to_string(), kind: T::KIND, staggering }
    }

    pub fn cell<T: Element>(name: &str) -> Self {
        Self::new::<T>(name, Staggering::Cell)
    }

    pub fn node<T: Element>(name: &str) -> Self {
        Self::new::<T>(name, Staggering::Node)
    }

    pub fn particle<T: Element>(name: &str) -> Self {
        Self::new::<T>(name, Staggering::Particle)
    }

    pub(crate) fn describe(kind: ElementKind, staggering: Staggering) -> String {
        format!("{:?}/{:?}", kind, staggering)
    }
}




/**
 * The logical extent of a variable on a patch, and the ghost-padded extent
 * of the memory backing it.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizes {
    pub logical: IndexSpace,
    pub storage: IndexSpace,
}




/**
 * The values of one variable on one patch and material. Values are stored
 * densely over the `storage` index space (which contains `logical` plus any
 * ghost padding), with the `i` index fastest-varying.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    staggering: Staggering,
    logical: IndexSpace,
    storage: IndexSpace,
    data: Buffer,
}




// ============================================================================
impl Field {

    /**
     * Create a zero-filled field over `logical`, padded by `ghost` elements
     * on every side.
     */
    pub fn zeros<T: Element>(staggering: Staggering, logical: IndexSpace, ghost: i64) -> Self {
        let storage = if staggering == Staggering::Particle { logical.clone() } else { logical.extend_all(ghost) };
        let data = T::wrap(vec![T::default(); storage.len()]);
        Self { staggering, logical, storage, data }
    }

    /**
     * Create a field whose logical values come from a closure. Ghost padding
     * is zero-filled.
     */
    pub fn from_fn<T, F>(staggering: Staggering, logical: IndexSpace, ghost: i64, f: F) -> Self
    where
        T: Element,
        F: Fn((i64, i64, i64)) -> T,
    {
        let mut field = Self::zeros::<T>(staggering, logical, ghost);
        let Field { logical, storage, data, .. } = &mut field;

        if let Some(slice) = T::slice_mut(data) {
            for index in logical.iter() {
                slice[storage.linear_offset(index)] = f(index);
            }
        }
        field
    }

    /**
     * Create a per-particle field holding the given values.
     */
    pub fn particles<T: Element>(values: Vec<T>) -> Self {
        let logical = range3d(0..values.len() as i64, 0..1, 0..1);
        Self {
            staggering: Staggering::Particle,
            storage: logical.clone(),
            logical,
            data: T::wrap(values),
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.data.kind()
    }

    pub fn staggering(&self) -> Staggering {
        self.staggering
    }

    pub fn logical(&self) -> &IndexSpace {
        &self.logical
    }

    pub fn storage(&self) -> &IndexSpace {
        &self.storage
    }

    pub fn sizes(&self) -> Sizes {
        Sizes { logical: self.logical.clone(), storage: self.storage.clone() }
    }

    pub fn elem_size(&self) -> usize {
        self.kind().size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_bytes_mut()
    }

    /**
     * Determine whether this field was created with the given label's type
     * and staggering.
     */
    pub fn matches(&self, label: &VarLabel) -> bool {
        self.kind() == label.kind && self.staggering == label.staggering
    }

    pub(crate) fn describe(&self) -> String {
        VarLabel::describe(self.kind(), self.staggering)
    }

    /**
     * Return a typed read-only view, or `None` if `T` is not the element
     * type of this field.
     */
    pub fn view<T: Element>(&self) -> Option<FieldView<'_, T>> {
        Some(FieldView {
            logical: &self.logical,
            storage: &self.storage,
            data: T::slice(&self.data)?,
        })
    }

    /**
     * Return a typed mutable view, or `None` if `T` is not the element type
     * of this field.
     */
    pub fn view_mut<T: Element>(&mut self) -> Option<FieldViewMut<'_, T>> {
        Some(FieldViewMut {
            logical: &self.logical,
            storage: &self.storage,
            data: T::slice_mut(&mut self.data)?,
        })
    }

    /**
     * Reallocate the backing memory over a larger storage space, keeping the
     * values already held. Does nothing if the current storage already
     * contains `storage`.
     */
    pub(crate) fn ensure_storage(&mut self, storage: &IndexSpace) {
        if self.storage.contains_space(storage) {
            return
        }
        let (i0, j0, k0) = self.storage.start();
        let (i1, j1, k1) = self.storage.end();
        let (a0, b0, c0) = storage.start();
        let (a1, b1, c1) = storage.end();
        let grown = range3d(i0.min(a0)..i1.max(a1), j0.min(b0)..j1.max(b1), k0.min(c0)..k1.max(c1));

        let mut data = Buffer::zeros(self.kind(), grown.len());
        let elem = self.elem_size();
        let old = self.storage.clone();

        // The old storage is contained in the grown one by construction.
        if let (Some(src), Some(dst)) = (old.memory_region_in(&old), old.memory_region_in(&grown)) {
            ghost::copy_strided(self.data.as_bytes(), &src, data.as_bytes_mut(), &dst, elem);
        }
        self.storage = grown;
        self.data = data;
    }
}




/**
 * A typed, read-only window onto a [`Field`]. Indexes are global (the same
 * as the patch index space) and may address ghost elements.
 */
pub struct FieldView<'a, T> {
    logical: &'a IndexSpace,
    storage: &'a IndexSpace,
    data: &'a [T],
}

impl<'a, T: Element> FieldView<'a, T> {

    pub fn logical(&self) -> &IndexSpace {
        self.logical
    }

    pub fn storage(&self) -> &IndexSpace {
        self.storage
    }

    /**
     * Return the value at the given index. Panics if the index is outside
     * the storage.
     */
    pub fn get(&self, index: (i64, i64, i64)) -> T {
        assert!(self.storage.contains(index), "index {:?} out of range on storage {:?}", index, self.storage);
        self.data[self.storage.linear_offset(index)]
    }

    /**
     * Return the whole backing slice, ghost elements included.
     */
    pub fn as_slice(&self) -> &[T] {
        self.data
    }

    /**
     * Return the logical values in memory order.
     */
    pub fn interior(&self) -> Vec<T> {
        self.logical.iter().map(|index| self.get(index)).collect()
    }
}




/**
 * A typed, mutable window onto a [`Field`].
 */
pub struct FieldViewMut<'a, T> {
    logical: &'a IndexSpace,
    storage: &'a IndexSpace,
    data: &'a mut [T],
}

impl<'a, T: Element> FieldViewMut<'a, T> {

    pub fn logical(&self) -> &IndexSpace {
        self.logical
    }

    pub fn storage(&self) -> &IndexSpace {
        self.storage
    }

    pub fn get(&self, index: (i64, i64, i64)) -> T {
        assert!(self.storage.contains(index), "index {:?} out of range on storage {:?}", index, self.storage);
        self.data[self.storage.linear_offset(index)]
    }

    pub fn set(&mut self, index: (i64, i64, i64), value: T) {
        assert!(self.storage.contains(index), "index {:?} out of range on storage {:?}", index, self.storage);
        self.data[self.storage.linear_offset(index)] = value
    }

    /**
     * Overwrite every logical value from a closure of the index.
     */
    pub fn fill_with<F>(&mut self, f: F)
    where
        F: Fn((i64, i64, i64)) -> T,
    {
        for index in self.logical.iter() {
            self.data[self.storage.linear_offset(index)] = f(index)
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
    }
}
