//! Packing and unpacking of rectangular sub-blocks of ghost-padded field
//! storage. There is a single strided routine, parameterized by the element
//! size and the strides of a [`MemoryRegion`]; all variable types go through
//! it as raw bytes. Packed buffers hold the selected elements with the `k`
//! index slowest and the `i` index fastest, and nothing else. Elements in a
//! buffer made by [`pack`] are little-endian whatever the host.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::index_space::{IndexSpace, MemoryRegion};
use crate::patch::PatchId;
use crate::variable::Field;
use crate::warehouse::{DataWarehouse, Generation};




/**
 * Invoke `f` with the byte offset of each contiguous row (a run along the
 * `i` axis) of the region, in k-major, j-next order. The second argument
 * is the byte length of the row.
 */
fn for_each_row<F>(region: &MemoryRegion, elem: usize, mut f: F)
where
    F: FnMut(usize, usize),
{
    let (_, sj, sk) = region.strides();
    let first = region.offset();
    let row = region.count.0 * elem;

    for k in 0..region.count.2 {
        for j in 0..region.count.1 {
            f((first + j * sj + k * sk) * elem, row)
        }
    }
}




/**
 * Copy the selected elements of `src` into a new contiguous buffer.
 */
pub fn pack_strided(src: &[u8], region: &MemoryRegion, elem: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(region.len() * elem);
    for_each_row(region, elem, |offset, row| {
        buffer.extend_from_slice(&src[offset..offset + row])
    });
    buffer
}




/**
 * Scatter a contiguous buffer into the selected elements of `dst`. The
 * buffer must hold exactly `region.len() * elem` bytes.
 */
pub fn unpack_strided(buffer: &[u8], dst: &mut [u8], region: &MemoryRegion, elem: usize) {
    assert_eq!(buffer.len(), region.len() * elem, "packed buffer does not match the region");
    let mut cursor = 0;
    for_each_row(region, elem, |offset, row| {
        dst[offset..offset + row].copy_from_slice(&buffer[cursor..cursor + row]);
        cursor += row;
    });
}




/**
 * Copy between two selections of equal count without an intermediate
 * buffer.
 */
pub(crate) fn copy_strided(src: &[u8], src_region: &MemoryRegion, dst: &mut [u8], dst_region: &MemoryRegion, elem: usize) {
    assert_eq!(src_region.count, dst_region.count);
    let mut rows = Vec::with_capacity(src_region.count.1 * src_region.count.2);
    for_each_row(src_region, elem, |offset, row| rows.push((offset, row)));
    let mut rows = rows.into_iter();
    for_each_row(dst_region, elem, |offset, row| {
        if let Some((source, _)) = rows.next() {
            dst[offset..offset + row].copy_from_slice(&src[source..source + row])
        }
    });
}




fn locate(field: &Field, region: &IndexSpace) -> Result<MemoryRegion> {
    region
        .memory_region_in(field.storage())
        .ok_or_else(|| Error::InsufficientGhostData {
            name: String::new(),
            region: region.clone(),
            storage: field.storage().clone(),
        })
}




/**
 * Extract the elements of `field` addressed by `region` (global indexes).
 * Fails with `InsufficientGhostData` if the field's storage does not cover
 * the region.
 */
pub fn pack(field: &Field, region: &IndexSpace) -> Result<Vec<u8>> {
    let selection = locate(field, region)?;
    let mut buffer = pack_strided(field.as_bytes(), &selection, field.elem_size());
    swap_elements_to_little_endian(&mut buffer, field.elem_size());
    Ok(buffer)
}




/**
 * Reverse the bytes of each element on big-endian hosts. The same call
 * converts in both directions; on little-endian hosts it does nothing.
 */
fn swap_elements_to_little_endian(bytes: &mut [u8], elem: usize) {
    if cfg!(target_endian = "big") && elem > 1 {
        for element in bytes.chunks_exact_mut(elem) {
            element.reverse()
        }
    }
}




/**
 * Write a buffer produced by [`pack`] back into `field` over `region`.
 */
pub fn unpack(buffer: &[u8], field: &mut Field, region: &IndexSpace) -> Result<()> {
    let selection = locate(field, region)?;
    let elem = field.elem_size();

    if buffer.len() != selection.len() * elem {
        return Err(Error::TransferFailure(format!(
            "packed buffer holds {} bytes, region {:?} needs {}",
            buffer.len(),
            region,
            selection.len() * elem
        )))
    }
    let native: Cow<[u8]> = if cfg!(target_endian = "big") {
        let mut owned = buffer.to_vec();
        swap_elements_to_little_endian(&mut owned, elem);
        Cow::Owned(owned)
    } else {
        Cow::Borrowed(buffer)
    };
    unpack_strided(&native, field.as_bytes_mut(), &selection, elem);
    Ok(())
}




/**
 * Copy the elements addressed by `region` from one field into another of
 * the same element type.
 */
pub fn copy_region(src: &Field, dst: &mut Field, region: &IndexSpace) -> Result<()> {
    if src.kind() != dst.kind() {
        return Err(Error::TypeMismatch {
            name: String::new(),
            expected: dst.describe(),
            found: src.describe(),
        })
    }
    let src_region = locate(src, region)?;
    let dst_region = locate(dst, region)?;
    let elem = src.elem_size();
    copy_strided(src.as_bytes(), &src_region, dst.as_bytes_mut(), &dst_region, elem);
    Ok(())
}




/**
 * Pack a region of a variable held in the data warehouse.
 */
pub fn pack_variable(
    dw: &DataWarehouse,
    name: &str,
    patch: PatchId,
    material: usize,
    generation: Generation,
    region: &IndexSpace) -> Result<Vec<u8>>
{
    let field = dw.field(name, patch, material, generation)?;
    pack(field, region).map_err(|e| e.named(name))
}




/**
 * Unpack a buffer into a region of a variable held in the data warehouse.
 * The entry's storage is grown if it does not reach the region, since the
 * ghost layer of an entry belongs to the scheduler rather than its
 * producer.
 */
pub(crate) fn unpack_variable(
    buffer: &[u8],
    dw: &mut DataWarehouse,
    name: &str,
    patch: PatchId,
    material: usize,
    generation: Generation,
    region: &IndexSpace) -> Result<()>
{
    let field = dw.field_mut(name, patch, material, generation)?;
    field.ensure_storage(region);
    unpack(buffer, field, region).map_err(|e| e.named(name))
}
