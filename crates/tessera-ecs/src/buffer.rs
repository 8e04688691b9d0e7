//! Dual-form column storage.
//!
//! A [`DualBuffer`] is a growable block of fixed-size elements. Its backing
//! form is picked once, at construction, from the element type:
//!
//! - [`StorageForm::Raw`]: types without drop glue live in a manually managed,
//!   properly aligned byte block. Moves are `memcpy`, growth is
//!   `std::alloc::realloc`.
//! - [`StorageForm::Managed`]: types that own heap data (anything with drop
//!   glue, e.g. `String`, `Vec`, `Arc`) live in a typed `Vec<T>` so Rust's
//!   ownership rules keep running their destructors.
//!
//! Every slot in `0..capacity` always holds an initialized value: growing
//! default-fills the new region, and removal resets the vacated slot. The
//! owning table tracks how many slots are live.
//!
//! # Safety
//!
//! The raw form stores type-erased bytes. [`ComponentVtable`] carries the
//! monomorphized helpers needed to default-fill and assign values, and every
//! typed access checks the requested `TypeId` against the vtable before
//! casting. The `*_unchecked` accessors skip the bounds check only.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::EcsError;

/// A type-erased component value on its way into a column.
pub type BoxedComponent = Box<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// StorageForm
// ---------------------------------------------------------------------------

/// Which backing a [`DualBuffer`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageForm {
    /// Aligned raw byte block for plain-data types.
    Raw,
    /// Typed `Vec<T>` for types that hold indirections.
    Managed,
}

impl StorageForm {
    /// The form a column of `T` uses.
    #[inline]
    pub fn of<T: 'static>() -> Self {
        if std::mem::needs_drop::<T>() {
            StorageForm::Managed
        } else {
            StorageForm::Raw
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable
// ---------------------------------------------------------------------------

/// Monomorphized helpers for one element type.
///
/// Created via [`ComponentVtable::new::<T>()`] at registration time and copied
/// into every column of that type.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    type_id: TypeId,
    type_name: &'static str,
    size: usize,
    align: usize,
    form: StorageForm,
    /// Write `count` default values starting at `dst`, treating the
    /// destination as uninitialized.
    fill_default: unsafe fn(*mut u8, usize),
    /// Allocate the managed backing with `capacity` default slots.
    new_managed: fn(usize) -> Box<dyn ManagedSlots>,
    /// Overwrite the initialized value at `dst` with the boxed value, or hand
    /// the box back on a type mismatch.
    assign_boxed: unsafe fn(*mut u8, BoxedComponent) -> Result<(), BoxedComponent>,
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("form", &self.form)
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn new<T: Component>() -> Self {
        unsafe fn fill_default_impl<T: Component>(dst: *mut u8, count: usize) {
            let dst = dst as *mut T;
            for i in 0..count {
                ptr::write(dst.add(i), T::default());
            }
        }

        fn new_managed_impl<T: Component>(capacity: usize) -> Box<dyn ManagedSlots> {
            let mut slots: Vec<T> = Vec::new();
            slots.resize_with(capacity, T::default);
            Box::new(slots)
        }

        unsafe fn assign_boxed_impl<T: Component>(
            dst: *mut u8,
            value: BoxedComponent,
        ) -> Result<(), BoxedComponent> {
            let value = value.downcast::<T>()?;
            *(dst as *mut T) = *value;
            Ok(())
        }

        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            form: StorageForm::of::<T>(),
            fill_default: fill_default_impl::<T>,
            new_managed: new_managed_impl::<T>,
            assign_boxed: assign_boxed_impl::<T>,
        }
    }

    /// Storage form for this type.
    #[inline]
    pub fn form(&self) -> StorageForm {
        self.form
    }

    /// Rust `TypeId` of the element type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the element type.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

// ---------------------------------------------------------------------------
// ManagedSlots -- the typed Vec behind the managed form
// ---------------------------------------------------------------------------

/// Operations the managed form needs from its typed `Vec<T>`.
pub(crate) trait ManagedSlots: Send + Sync {
    fn slot_count(&self) -> usize;
    fn grow_to(&mut self, new_capacity: usize);
    fn base_ptr(&self) -> *const u8;
    fn base_ptr_mut(&mut self) -> *mut u8;
    fn swap_remove_slot(&mut self, index: usize, last: usize);
    fn reset_slot(&mut self, index: usize);
    /// Move `count` values into `dst`, leaving defaults behind. Returns
    /// `false` if `dst` holds a different element type.
    fn move_range(
        &mut self,
        src_index: usize,
        dst: &mut dyn ManagedSlots,
        dst_index: usize,
        count: usize,
    ) -> bool;
    fn release(&mut self);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ManagedSlots for Vec<T> {
    fn slot_count(&self) -> usize {
        self.len()
    }

    fn grow_to(&mut self, new_capacity: usize) {
        self.resize_with(new_capacity, T::default);
    }

    fn base_ptr(&self) -> *const u8 {
        self.as_ptr() as *const u8
    }

    fn base_ptr_mut(&mut self) -> *mut u8 {
        self.as_mut_ptr() as *mut u8
    }

    fn swap_remove_slot(&mut self, index: usize, last: usize) {
        self.swap(index, last);
        self[last] = T::default();
    }

    fn reset_slot(&mut self, index: usize) {
        self[index] = T::default();
    }

    fn move_range(
        &mut self,
        src_index: usize,
        dst: &mut dyn ManagedSlots,
        dst_index: usize,
        count: usize,
    ) -> bool {
        let Some(dst) = dst.as_any_mut().downcast_mut::<Vec<T>>() else {
            return false;
        };
        for i in 0..count {
            dst[dst_index + i] = std::mem::take(&mut self[src_index + i]);
        }
        true
    }

    fn release(&mut self) {
        *self = Vec::new();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// RawBlock -- the aligned byte block behind the raw form
// ---------------------------------------------------------------------------

/// Manually managed, aligned storage for plain-data elements.
struct RawBlock {
    /// Pointer to the heap allocation (null when nothing is allocated).
    data: *mut u8,
    /// Number of elements that fit in the current allocation.
    capacity: usize,
    item_size: usize,
    item_align: usize,
}

// RawBlock only stores bytes of `Component` types, which are Send + Sync.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
    fn new(item_size: usize, item_align: usize) -> Self {
        Self {
            data: ptr::null_mut(),
            capacity: 0,
            item_size,
            item_align,
        }
    }

    fn layout_for_capacity(&self, cap: usize) -> Option<Layout> {
        if self.item_size == 0 || cap == 0 {
            return None;
        }
        let bytes = self
            .item_size
            .checked_mul(cap)
            .expect("dual buffer capacity overflow");
        Some(Layout::from_size_align(bytes, self.item_align).expect("dual buffer capacity overflow"))
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        if self.data.is_null() {
            // Aligned dangling pointer for ZSTs and empty blocks.
            self.item_align as *mut u8
        } else {
            self.data
        }
    }

    #[inline]
    unsafe fn ptr_at(&self, index: usize) -> *mut u8 {
        self.base().add(index * self.item_size)
    }

    /// Grow to `new_capacity` elements in place (realloc) and default-fill
    /// the new region.
    unsafe fn grow(&mut self, new_capacity: usize, vtable: &ComponentVtable) {
        let old_capacity = self.capacity;
        if let Some(new_layout) = self.layout_for_capacity(new_capacity) {
            let new_data = match self.layout_for_capacity(old_capacity) {
                Some(old_layout) if !self.data.is_null() => {
                    alloc::realloc(self.data, old_layout, new_layout.size())
                }
                _ => alloc::alloc(new_layout),
            };
            if new_data.is_null() {
                alloc::handle_alloc_error(new_layout);
            }
            self.data = new_data;
        }
        self.capacity = new_capacity;
        (vtable.fill_default)(self.ptr_at(old_capacity), new_capacity - old_capacity);
    }

    unsafe fn swap_remove(&mut self, index: usize, last: usize, vtable: &ComponentVtable) {
        if self.item_size > 0 && index != last {
            ptr::copy_nonoverlapping(self.ptr_at(last), self.ptr_at(index), self.item_size);
        }
        (vtable.fill_default)(self.ptr_at(last), 1);
    }

    /// Deallocate. Calling this twice is a no-op.
    fn release(&mut self) {
        if let Some(layout) = self.layout_for_capacity(self.capacity) {
            if !self.data.is_null() {
                unsafe { alloc::dealloc(self.data, layout) };
            }
        }
        self.data = ptr::null_mut();
        self.capacity = 0;
    }
}

// ---------------------------------------------------------------------------
// DualBuffer
// ---------------------------------------------------------------------------

enum Backing {
    Raw(RawBlock),
    Managed(Box<dyn ManagedSlots>),
}

/// A growable, type-erased block of fixed-size elements with a storage form
/// chosen once at construction.
pub struct DualBuffer {
    vtable: ComponentVtable,
    backing: Backing,
}

impl fmt::Debug for DualBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualBuffer")
            .field("type_name", &self.vtable.type_name)
            .field("form", &self.vtable.form)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl DualBuffer {
    /// Create a buffer with `capacity` default-initialized slots.
    pub fn new(vtable: &ComponentVtable, capacity: usize) -> Self {
        let backing = match vtable.form {
            StorageForm::Managed => Backing::Managed((vtable.new_managed)(capacity)),
            StorageForm::Raw => {
                let mut block = RawBlock::new(vtable.size, vtable.align);
                if capacity > 0 {
                    unsafe { block.grow(capacity, vtable) };
                }
                Backing::Raw(block)
            }
        };
        Self {
            vtable: *vtable,
            backing,
        }
    }

    /// The storage form picked at construction.
    #[inline]
    pub fn form(&self) -> StorageForm {
        self.vtable.form
    }

    /// The element type's vtable.
    #[inline]
    pub fn vtable(&self) -> &ComponentVtable {
        &self.vtable
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Raw(block) => block.capacity,
            Backing::Managed(slots) => slots.slot_count(),
        }
    }

    /// Grow to `new_capacity` slots, keeping existing values and
    /// default-filling the new ones.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::CapacityShrink`] if `new_capacity` is below the
    /// current capacity.
    pub fn grow(&mut self, new_capacity: usize) -> Result<(), EcsError> {
        let current = self.capacity();
        if new_capacity < current {
            return Err(EcsError::CapacityShrink {
                requested: new_capacity,
                current,
            });
        }
        if new_capacity == current {
            return Ok(());
        }
        match &mut self.backing {
            Backing::Raw(block) => unsafe { block.grow(new_capacity, &self.vtable) },
            Backing::Managed(slots) => slots.grow_to(new_capacity),
        }
        Ok(())
    }

    #[inline]
    fn base_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Raw(block) => block.base(),
            Backing::Managed(slots) => slots.base_ptr(),
        }
    }

    #[inline]
    fn base_ptr_mut(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Raw(block) => block.base(),
            Backing::Managed(slots) => slots.base_ptr_mut(),
        }
    }

    /// Mutable raw pointer to slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must be at most `capacity()`.
    #[inline]
    unsafe fn ptr_at_mut(&mut self, index: usize) -> *mut u8 {
        debug_assert!(index <= self.capacity());
        let size = self.vtable.size;
        self.base_ptr_mut().add(index * size)
    }

    fn check_type<T: 'static>(&self) -> Result<(), EcsError> {
        if TypeId::of::<T>() == self.vtable.type_id {
            Ok(())
        } else {
            Err(EcsError::TypeMismatch {
                expected: self.vtable.type_name,
                found: type_name::<T>(),
            })
        }
    }

    /// Typed view of every slot, or `None` if `T` is not the element type.
    pub fn as_slice<T: 'static>(&self) -> Option<&[T]> {
        self.check_type::<T>().ok()?;
        Some(unsafe { std::slice::from_raw_parts(self.base_ptr() as *const T, self.capacity()) })
    }

    /// Mutable typed view of every slot, or `None` if `T` is not the element
    /// type.
    pub fn as_mut_slice<T: 'static>(&mut self) -> Option<&mut [T]> {
        self.check_type::<T>().ok()?;
        let len = self.capacity();
        Some(unsafe { std::slice::from_raw_parts_mut(self.base_ptr_mut() as *mut T, len) })
    }

    /// Checked read of slot `index`.
    pub fn get<T: 'static>(&self, index: usize) -> Option<&T> {
        self.as_slice::<T>()?.get(index)
    }

    /// Checked mutable access to slot `index`.
    pub fn get_mut<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice::<T>()?.get_mut(index)
    }

    /// Read slot `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `T` must be the element type and `index < capacity()`.
    #[inline]
    pub unsafe fn get_unchecked<T: 'static>(&self, index: usize) -> &T {
        debug_assert!(self.check_type::<T>().is_ok());
        debug_assert!(index < self.capacity());
        &*(self.base_ptr() as *const T).add(index)
    }

    /// Mutable access to slot `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `T` must be the element type and `index < capacity()`.
    #[inline]
    pub unsafe fn get_unchecked_mut<T: 'static>(&mut self, index: usize) -> &mut T {
        debug_assert!(self.check_type::<T>().is_ok());
        debug_assert!(index < self.capacity());
        &mut *(self.ptr_at_mut(index) as *mut T)
    }

    /// Overwrite slot `index`.
    ///
    /// # Errors
    ///
    /// [`EcsError::TypeMismatch`] for a foreign type,
    /// [`EcsError::RowOutOfBounds`] past the capacity.
    pub fn set<T: 'static>(&mut self, index: usize, value: T) -> Result<(), EcsError> {
        self.check_type::<T>()?;
        let len = self.capacity();
        let slot = self
            .get_mut::<T>(index)
            .ok_or(EcsError::RowOutOfBounds { row: index, len })?;
        *slot = value;
        Ok(())
    }

    /// Overwrite slot `index` with a type-erased value.
    ///
    /// # Errors
    ///
    /// [`EcsError::TypeMismatch`] if the box does not hold the element type,
    /// [`EcsError::RowOutOfBounds`] past the capacity.
    pub fn assign_boxed(&mut self, index: usize, value: BoxedComponent) -> Result<(), EcsError> {
        let len = self.capacity();
        if index >= len {
            return Err(EcsError::RowOutOfBounds { row: index, len });
        }
        let assign = self.vtable.assign_boxed;
        unsafe { assign(self.ptr_at_mut(index), value) }.map_err(|_| {
            EcsError::TypeMismatch {
                expected: self.vtable.type_name,
                found: "boxed value of another type",
            }
        })
    }

    /// Move the value at `last` into `index` and reset `last` to the default
    /// value. The value previously at `index` is dropped.
    ///
    /// Both indices must be below `capacity()`.
    pub fn swap_remove(&mut self, index: usize, last: usize) {
        assert!(index <= last && last < self.capacity(), "swap_remove out of bounds");
        match &mut self.backing {
            Backing::Raw(block) => unsafe { block.swap_remove(index, last, &self.vtable) },
            Backing::Managed(slots) => slots.swap_remove_slot(index, last),
        }
    }

    /// Reset slot `index` to the default value.
    pub fn reset(&mut self, index: usize) {
        assert!(index < self.capacity(), "reset out of bounds");
        match &mut self.backing {
            Backing::Raw(block) => unsafe { (self.vtable.fill_default)(block.ptr_at(index), 1) },
            Backing::Managed(slots) => slots.reset_slot(index),
        }
    }

    /// Copy `count` elements starting at `src_index` into `dst` at
    /// `dst_index`. Managed values are moved, leaving defaults behind.
    ///
    /// # Errors
    ///
    /// [`EcsError::TypeMismatch`] if the buffers hold different types,
    /// [`EcsError::RowOutOfBounds`] if either range exceeds its capacity.
    pub fn copy_range(
        &mut self,
        src_index: usize,
        dst: &mut DualBuffer,
        dst_index: usize,
        count: usize,
    ) -> Result<(), EcsError> {
        if self.vtable.type_id != dst.vtable.type_id {
            return Err(EcsError::TypeMismatch {
                expected: dst.vtable.type_name,
                found: self.vtable.type_name,
            });
        }
        let src_len = self.capacity();
        if src_index + count > src_len {
            return Err(EcsError::RowOutOfBounds {
                row: src_index + count,
                len: src_len,
            });
        }
        let dst_len = dst.capacity();
        if dst_index + count > dst_len {
            return Err(EcsError::RowOutOfBounds {
                row: dst_index + count,
                len: dst_len,
            });
        }
        match (&mut self.backing, &mut dst.backing) {
            (Backing::Raw(src), Backing::Raw(out)) => {
                if src.item_size > 0 && count > 0 {
                    unsafe {
                        ptr::copy_nonoverlapping(
                            src.ptr_at(src_index),
                            out.ptr_at(dst_index),
                            count * src.item_size,
                        );
                    }
                }
                Ok(())
            }
            (Backing::Managed(src), Backing::Managed(out)) => {
                if src.move_range(src_index, out.as_mut(), dst_index, count) {
                    Ok(())
                } else {
                    Err(EcsError::TypeMismatch {
                        expected: dst.vtable.type_name,
                        found: self.vtable.type_name,
                    })
                }
            }
            // Same TypeId always means the same form.
            _ => unreachable!("dual buffers of one type always share a storage form"),
        }
    }

    /// Release the backing allocation. Dropping the values of a managed
    /// buffer happens here too. Calling this more than once is a no-op.
    pub fn dispose(&mut self) {
        match &mut self.backing {
            Backing::Raw(block) => block.release(),
            Backing::Managed(slots) => slots.release(),
        }
    }
}

impl Drop for DualBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// TypedBuffer
// ---------------------------------------------------------------------------

/// A [`DualBuffer`] whose element type is known statically.
pub struct TypedBuffer<T: Component> {
    inner: DualBuffer,
    _marker: PhantomData<T>,
}

impl<T: Component + fmt::Debug> fmt::Debug for TypedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: Component> Default for TypedBuffer<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T: Component> TypedBuffer<T> {
    /// Create a buffer with `capacity` default slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: DualBuffer::new(&ComponentVtable::new::<T>(), capacity),
            _marker: PhantomData,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// The storage form picked for `T`.
    #[inline]
    pub fn form(&self) -> StorageForm {
        self.inner.form()
    }

    /// See [`DualBuffer::grow`].
    pub fn grow(&mut self, new_capacity: usize) -> Result<(), EcsError> {
        self.inner.grow(new_capacity)
    }

    /// Every slot as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.inner.base_ptr() as *const T, self.capacity()) }
    }

    /// Every slot as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.capacity();
        unsafe { std::slice::from_raw_parts_mut(self.inner.base_ptr_mut() as *mut T, len) }
    }

    /// Checked read.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Checked mutable access.
    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    /// Read without a bounds check.
    ///
    /// # Safety
    ///
    /// `index < capacity()`.
    #[inline]
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        self.inner.get_unchecked::<T>(index)
    }

    /// Mutable access without a bounds check.
    ///
    /// # Safety
    ///
    /// `index < capacity()`.
    #[inline]
    pub unsafe fn get_unchecked_mut(&mut self, index: usize) -> &mut T {
        self.inner.get_unchecked_mut::<T>(index)
    }

    /// Checked write.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), EcsError> {
        self.inner.set(index, value)
    }

    /// See [`DualBuffer::swap_remove`].
    pub fn swap_remove(&mut self, index: usize, last: usize) {
        self.inner.swap_remove(index, last);
    }

    /// See [`DualBuffer::reset`].
    pub fn reset(&mut self, index: usize) {
        self.inner.reset(index);
    }

    /// See [`DualBuffer::copy_range`].
    pub fn copy_range(
        &mut self,
        src_index: usize,
        dst: &mut TypedBuffer<T>,
        dst_index: usize,
        count: usize,
    ) -> Result<(), EcsError> {
        self.inner.copy_range(src_index, &mut dst.inner, dst_index, count)
    }

    /// See [`DualBuffer::dispose`].
    pub fn dispose(&mut self) {
        self.inner.dispose();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Marker;

    /// Counts its own drops.
    #[derive(Default)]
    struct DropCounter(Option<Arc<AtomicUsize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            if let Some(counter) = &self.0 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn storage_form_follows_drop_glue() {
        assert_eq!(StorageForm::of::<Pos>(), StorageForm::Raw);
        assert_eq!(StorageForm::of::<u32>(), StorageForm::Raw);
        assert_eq!(StorageForm::of::<String>(), StorageForm::Managed);
        assert_eq!(StorageForm::of::<Vec<u8>>(), StorageForm::Managed);
    }

    #[test]
    fn grow_preserves_values_and_default_fills() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<Pos>(), 2);
        buf.set(0, Pos { x: 1.0, y: 2.0 }).unwrap();
        buf.set(1, Pos { x: 3.0, y: 4.0 }).unwrap();
        buf.grow(8).unwrap();

        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.get::<Pos>(0), Some(&Pos { x: 1.0, y: 2.0 }));
        assert_eq!(buf.get::<Pos>(1), Some(&Pos { x: 3.0, y: 4.0 }));
        for i in 2..8 {
            assert_eq!(buf.get::<Pos>(i), Some(&Pos::default()));
        }
    }

    #[test]
    fn shrinking_is_rejected() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<u64>(), 4);
        assert!(matches!(
            buf.grow(2),
            Err(EcsError::CapacityShrink { requested: 2, current: 4 })
        ));
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn typed_access_checks_type() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<u32>(), 1);
        assert!(buf.get::<u64>(0).is_none());
        assert!(matches!(buf.set(0, 1.0f32), Err(EcsError::TypeMismatch { .. })));
        assert!(buf.get::<u32>(1).is_none());
        buf.set(0, 7u32).unwrap();
        assert_eq!(unsafe { *buf.get_unchecked::<u32>(0) }, 7);
    }

    #[test]
    fn managed_buffer_holds_strings() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<String>(), 1);
        assert_eq!(buf.form(), StorageForm::Managed);
        buf.set(0, "alpha".to_owned()).unwrap();
        buf.grow(3).unwrap();
        buf.set(2, "gamma".to_owned()).unwrap();
        assert_eq!(buf.as_slice::<String>().unwrap(), &["alpha", "", "gamma"]);
    }

    #[test]
    fn swap_remove_raw_moves_last_and_resets_it() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<i32>(), 3);
        for i in 0..3 {
            buf.set(i, i as i32 + 1).unwrap();
        }
        buf.swap_remove(0, 2);
        assert_eq!(buf.as_slice::<i32>().unwrap(), &[3, 2, 0]);
    }

    #[test]
    fn swap_remove_managed_moves_last_and_resets_it() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<String>(), 3);
        for (i, s) in ["a", "b", "c"].into_iter().enumerate() {
            buf.set(i, s.to_owned()).unwrap();
        }
        buf.swap_remove(0, 2);
        assert_eq!(buf.as_slice::<String>().unwrap(), &["c", "b", ""]);
    }

    #[test]
    fn copy_range_raw_and_managed() {
        let vt = ComponentVtable::new::<i32>();
        let mut src = DualBuffer::new(&vt, 4);
        let mut dst = DualBuffer::new(&vt, 4);
        for i in 0..4 {
            src.set(i, 10 + i as i32).unwrap();
        }
        src.copy_range(1, &mut dst, 0, 2).unwrap();
        assert_eq!(dst.as_slice::<i32>().unwrap(), &[11, 12, 0, 0]);

        let vt = ComponentVtable::new::<String>();
        let mut src = DualBuffer::new(&vt, 2);
        let mut dst = DualBuffer::new(&vt, 2);
        src.set(0, "moved".to_owned()).unwrap();
        src.copy_range(0, &mut dst, 1, 1).unwrap();
        assert_eq!(dst.get::<String>(1).map(String::as_str), Some("moved"));
        assert_eq!(src.get::<String>(0).map(String::as_str), Some(""));
    }

    #[test]
    fn copy_range_rejects_mismatched_types_and_ranges() {
        let mut src = DualBuffer::new(&ComponentVtable::new::<i32>(), 2);
        let mut other = DualBuffer::new(&ComponentVtable::new::<u32>(), 2);
        assert!(matches!(
            src.copy_range(0, &mut other, 0, 1),
            Err(EcsError::TypeMismatch { .. })
        ));
        let mut dst = DualBuffer::new(&ComponentVtable::new::<i32>(), 1);
        assert!(matches!(
            src.copy_range(0, &mut dst, 0, 2),
            Err(EcsError::RowOutOfBounds { .. })
        ));
    }

    #[test]
    fn zero_sized_elements_need_no_allocation() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<Marker>(), 0);
        buf.grow(16).unwrap();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.get::<Marker>(15), Some(&Marker));
        buf.swap_remove(3, 15);
    }

    #[test]
    fn dispose_is_idempotent_and_drops_values_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut buf = DualBuffer::new(&ComponentVtable::new::<DropCounter>(), 3);
        for i in 0..3 {
            buf.set(i, DropCounter(Some(drops.clone()))).unwrap();
        }
        buf.dispose();
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(buf.capacity(), 0);
        buf.dispose();
        drop(buf);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn assign_boxed_checks_type() {
        let mut buf = DualBuffer::new(&ComponentVtable::new::<String>(), 1);
        buf.assign_boxed(0, Box::new("boxed".to_owned())).unwrap();
        assert_eq!(buf.get::<String>(0).map(String::as_str), Some("boxed"));
        assert!(matches!(
            buf.assign_boxed(0, Box::new(5u8)),
            Err(EcsError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn typed_buffer_slices() {
        let mut buf: TypedBuffer<u32> = TypedBuffer::new(2);
        buf.set(1, 9).unwrap();
        buf.grow(4).unwrap();
        assert_eq!(buf.as_slice(), &[0, 9, 0, 0]);
        *buf.get_mut(0).unwrap() = 3;
        let mut other: TypedBuffer<u32> = TypedBuffer::new(4);
        buf.copy_range(0, &mut other, 2, 2).unwrap();
        assert_eq!(other.as_slice(), &[0, 0, 3, 9]);
    }
}
