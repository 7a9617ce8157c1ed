//! Transfer records, and the byte layout of the data they carry between
//! processes.
//!
//! A payload is laid out as: the variable name (a little-endian `u64` byte
//! count followed by UTF-8), the patch id and material index (`u64` each),
//! the region as six `i64` corner values (lower corner first), and finally
//! the packed elements (a `u64` byte count followed by the bytes, in the
//! k-major, i-fastest order produced by [`crate::ghost::pack`]). Integers and
//! elements alike are little-endian.

use std::io::prelude::*;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::index_space::IndexSpace;
use crate::patch::{PatchId, Rank};
use crate::warehouse::Generation;




/**
 * One cross-process data movement: the elements of `variable` on
 * `source_patch` which fill `region` of the ghost layer of `dest_patch`.
 * Transfers of the "new" generation are sent as soon as their producer has
 * run; transfers of the "old" generation carry no producer and are sent at
 * the start of the step.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: usize,
    pub source_rank: Rank,
    pub dest_rank: Rank,
    pub variable: String,
    pub source_patch: PatchId,
    pub dest_patch: PatchId,
    pub material: usize,
    pub region: IndexSpace,
    pub generation: Generation,
    pub producer: Option<NodeId>,
}




/**
 * The data of a transfer record, as it travels on the wire.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct TransferPayload {
    pub variable: String,
    pub patch: PatchId,
    pub material: usize,
    pub region: IndexSpace,
    pub data: Vec<u8>,
}




// ============================================================================
impl TransferPayload {

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(80 + self.variable.len() + self.data.len());
        bytes.extend_from_slice(&(self.variable.len() as u64).to_le_bytes());
        bytes.extend_from_slice(self.variable.as_bytes());
        bytes.extend_from_slice(&(self.patch as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.material as u64).to_le_bytes());

        for corner in self.region.corners() {
            bytes.extend_from_slice(&corner.to_le_bytes());
        }
        bytes.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut stream = bytes;
        let name = read_bytes_vec(&mut stream)?;
        let variable = String::from_utf8(name).map_err(|e| Error::TransferFailure(format!("bad variable name: {}", e)))?;
        let patch = read_u64(&mut stream)? as PatchId;
        let material = read_u64(&mut stream)? as usize;

        let mut corners = [0; 6];
        for corner in corners.iter_mut() {
            *corner = i64::from_le_bytes(read_bytes_array(&mut stream)?);
        }
        if (0..3).any(|axis| corners[axis] > corners[axis + 3]) {
            return Err(Error::TransferFailure(format!("bad region {:?}", corners)))
        }
        let data = read_bytes_vec(&mut stream)?;

        if !stream.is_empty() {
            return Err(Error::TransferFailure(format!("{} trailing bytes after payload", stream.len())))
        }
        Ok(Self {
            variable,
            patch,
            material,
            region: IndexSpace::from_corners(corners),
            data,
        })
    }

    /**
     * Check that this payload is the one described by a transfer record.
     */
    pub fn check(&self, record: &TransferRecord) -> Result<()> {
        if self.variable != record.variable
            || self.patch != record.source_patch
            || self.material != record.material
            || self.region != record.region
        {
            Err(Error::TransferFailure(format!(
                "payload for '{}' from patch {} does not match transfer {} ('{}' from patch {})",
                self.variable, self.patch, record.id, record.variable, record.source_patch
            )))
        } else {
            Ok(())
        }
    }
}




fn read_bytes_array<R: Read, const SIZE: usize>(stream: &mut R) -> Result<[u8; SIZE]> {
    let mut buffer = [0; SIZE];
    stream
        .read_exact(&mut buffer)
        .map_err(|e| Error::TransferFailure(format!("truncated payload: {}", e)))?;
    Ok(buffer)
}

fn read_u64<R: Read>(stream: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_bytes_array(stream)?))
}

fn read_bytes_vec<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let size = read_u64(stream)? as usize;
    let mut buffer = Vec::new();
    stream
        .by_ref()
        .take(size as u64)
        .read_to_end(&mut buffer)
        .map_err(|e| Error::TransferFailure(format!("truncated payload: {}", e)))?;

    if buffer.len() != size {
        return Err(Error::TransferFailure(format!("payload declares {} bytes, {} present", size, buffer.len())))
    }
    Ok(buffer)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::TransferPayload;
    use crate::index_space::range3d;

    fn payload() -> TransferPayload {
        TransferPayload {
            variable: "rho".to_string(),
            patch: 3,
            material: 1,
            region: range3d(-1..0, 0..4, 2..5),
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    #[test]
    fn layout_is_length_prefixed_little_endian() {
        let bytes = payload().encode();
        assert_eq!(bytes.len(), 8 + 3 + 8 + 8 + 48 + 8 + 8);
        assert_eq!(&bytes[0..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[8..11], b"rho");
        assert_eq!(&bytes[11..19], &3u64.to_le_bytes());
        assert_eq!(&bytes[19..27], &1u64.to_le_bytes());
        assert_eq!(&bytes[27..35], &(-1i64).to_le_bytes());
        assert_eq!(&bytes[75..83], &8u64.to_le_bytes());
        assert_eq!(TransferPayload::decode(&bytes), Ok(payload()));
    }

    #[test]
    fn truncated_and_padded_buffers_are_transfer_failures() {
        let bytes = payload().encode();
        assert!(TransferPayload::decode(&bytes[..bytes.len() - 1]).unwrap_err().is_transfer_failure());
        assert!(TransferPayload::decode(&bytes[..5]).unwrap_err().is_transfer_failure());

        let mut padded = bytes;
        padded.push(0);
        assert!(TransferPayload::decode(&padded).unwrap_err().is_transfer_failure());
    }
}
