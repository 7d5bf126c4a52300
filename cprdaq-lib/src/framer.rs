//! Find the event records in a completed DMA transfer
//!
//! A record, as the COPPER writes it into the event FIFO
//! (32bit words, little endian):
//!
//! ```text
//! 0xFFFFFAFA | total | size A | size B | size C | size D | payload ... | 0xFFFFF5F5
//! ```
//!
//! `total` counts all words of the record, including the
//! 6 header words and the trailer, so it has to be
//! `size A + size B + size C + size D + 7`.

use std::fmt;

use crate::constants::{
  SIZEOF_U32,
  N_FINESSE,
  RECORD_MAGIC,
  RECORD_TRAILER,
  RECORD_HEADER_WORDS,
  RECORD_TRAILER_WORDS,
};
use crate::dma_buffer::BufferId;

/// Where a framed event lives
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EventDescriptor {
  /// The DMA buffer holding the record
  pub buffer : BufferId,
  /// Byte offset of the (not yet read part of the)
  /// record within the buffer
  pub offset : usize,
  /// Bytes left to read
  pub len    : usize,
}

impl EventDescriptor {
  pub fn new(buffer : BufferId, offset : usize, len : usize) -> Self {
    Self {
      buffer,
      offset,
      len,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Drop the first n bytes, they have been read
  pub fn advance(&mut self, n : usize) {
    let n = n.min(self.len);
    self.offset += n;
    self.len    -= n;
  }
}

impl fmt::Display for EventDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<EventDescriptor: buf {} offset {} len {}>", self.buffer, self.offset, self.len)
  }
}

/// Why a position in a region is not the start of a record
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FrameFault {
  /// Not even a full header left
  Truncated,
  BadMagic(u32),
  /// total does not match the FINESSE sizes
  BadLength { total : u32, expected : u64 },
  /// total points beyond the region
  Overrun { total : u32 },
  BadTrailer(u32),
}

impl fmt::Display for FrameFault {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      FrameFault::Truncated                    => write!(f, "truncated header"),
      FrameFault::BadMagic(w)                  => write!(f, "bad magic {:#010x}", w),
      FrameFault::BadLength {total, expected}  => write!(f, "total {} but sizes add up to {}", total, expected),
      FrameFault::Overrun {total}              => write!(f, "total {} exceeds the region", total),
      FrameFault::BadTrailer(w)                => write!(f, "bad trailer {:#010x}", w),
    }
  }
}

/// Result of scanning one region
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FramedRegion {
  pub events     : Vec<EventDescriptor>,
  /// Words behind the last good record which could
  /// not be framed (only counted after an integrity error)
  pub lost_words : usize,
}

#[inline]
fn word_at(region : &[u8], pos : usize) -> u32 {
  let k = pos*SIZEOF_U32;
  u32::from_le_bytes([region[k], region[k+1], region[k+2], region[k+3]])
}

/// Check if a record starts at word pos. Returns
/// its length in words.
pub fn check_record(region : &[u8], pos : usize) -> Result<usize, FrameFault> {
  let n_words = region.len() / SIZEOF_U32;
  if pos + RECORD_HEADER_WORDS > n_words {
    return Err(FrameFault::Truncated);
  }
  let magic = word_at(region, pos);
  if magic != RECORD_MAGIC {
    return Err(FrameFault::BadMagic(magic));
  }
  let total = word_at(region, pos + 1);
  let mut expected = (RECORD_HEADER_WORDS + RECORD_TRAILER_WORDS) as u64;
  for k in 0..N_FINESSE {
    expected += word_at(region, pos + 2 + k) as u64;
  }
  if total as u64 != expected {
    return Err(FrameFault::BadLength { total, expected });
  }
  let total_words = total as usize;
  if pos + total_words > n_words {
    return Err(FrameFault::Overrun { total });
  }
  let trailer = word_at(region, pos + total_words - 1);
  if trailer != RECORD_TRAILER {
    return Err(FrameFault::BadTrailer(trailer));
  }
  Ok(total_words)
}

/// Split a completed transfer into event records
///
/// # Arguments
///
/// * region      : the bytes the DMA engine wrote
/// * buffer      : the buffer the region lives in
/// * base_offset : byte offset of region within buffer
pub fn scan(region      : &[u8],
            buffer      : BufferId,
            base_offset : usize) -> FramedRegion {
  let n_words    = region.len() / SIZEOF_U32;
  let mut framed = FramedRegion::default();
  let mut pos    = 0usize;
  while pos < n_words {
    match check_record(region, pos) {
      Ok(total) => {
        framed.events.push(EventDescriptor::new(buffer,
                                                base_offset + pos*SIZEOF_U32,
                                                total*SIZEOF_U32));
        pos += total;
      }
      Err(fault) => {
        if framed.events.is_empty() {
          debug!("Nothing to frame in buffer {} at {}, {}", buffer, base_offset, fault);
        } else {
          framed.lost_words = n_words - pos;
          error!("Corrupt record in buffer {} at word {} ({}), dropping {} words!",
                 buffer, pos, fault, framed.lost_words);
        }
        break;
      }
    }
  }
  framed
}

/// XOR of all words in a (word aligned) byte slice
pub fn xor_words(bytes : &[u8]) -> u32 {
  bytes.chunks_exact(SIZEOF_U32)
       .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// Build a record, as the COPPER would deliver it
///
/// Used by the software COPPER and the tests.
pub fn build_record(sizes : [u32; N_FINESSE], payload : &[u32]) -> Vec<u32> {
  let total = sizes.iter().sum::<u32>() + (RECORD_HEADER_WORDS + RECORD_TRAILER_WORDS) as u32;
  let mut words = Vec::<u32>::with_capacity(total as usize);
  words.push(RECORD_MAGIC);
  words.push(total);
  words.extend_from_slice(&sizes);
  words.extend_from_slice(payload);
  words.push(RECORD_TRAILER);
  words
}

/// Words into bytes, the way they sit in the DMA buffer
pub fn words_to_bytes(words : &[u32]) -> Vec<u8> {
  let mut bytes = Vec::<u8>::with_capacity(words.len()*SIZEOF_U32);
  for w in words {
    bytes.extend_from_slice(&w.to_le_bytes());
  }
  bytes
}

#[cfg(test)]
mod test_framer {
  use super::*;

  fn record(n : u32) -> Vec<u32> {
    let payload : Vec<u32> = (0..n).map(|k| 0xA000 + k).collect();
    build_record([n, 0, 0, 0], &payload)
  }

  #[test]
  fn empty_region() {
    let framed = scan(&[], 0, 0);
    assert!(framed.events.is_empty());
    assert_eq!(framed.lost_words, 0);
  }

  #[test]
  fn concatenated_records() {
    for k in 0..6usize {
      let mut words = Vec::<u32>::new();
      let mut starts = Vec::<(usize, usize)>::new();
      for n in 0..k {
        let rec = record(n as u32 * 3);
        starts.push((words.len()*4, rec.len()*4));
        words.extend(rec);
      }
      let framed = scan(&words_to_bytes(&words), 2, 64);
      assert_eq!(framed.events.len(), k);
      for (ev, (start, len)) in framed.events.iter().zip(starts.iter()) {
        assert_eq!(ev.buffer, 2);
        assert_eq!(ev.offset, 64 + start);
        assert_eq!(ev.len, *len);
      }
      assert_eq!(framed.lost_words, 0);
    }
  }

  #[test]
  fn garbage_after_records() {
    let mut words = record(2);
    words.extend(record(5));
    words.extend_from_slice(&[0xdeadbeef, 1, 2, 3, 4, 5, 6, 7]);
    let framed = scan(&words_to_bytes(&words), 0, 0);
    assert_eq!(framed.events.len(), 2);
    assert_eq!(framed.lost_words, 8);
  }

  #[test]
  fn garbage_first_is_nothing() {
    let mut words = vec![0u32; 8];
    words.extend(record(2));
    let framed = scan(&words_to_bytes(&words), 0, 0);
    assert!(framed.events.is_empty());
    assert_eq!(framed.lost_words, 0);
  }

  #[test]
  fn bad_arithmetic() {
    let mut words = record(3);
    words[1] += 1;
    let bytes = words_to_bytes(&words);
    assert_eq!(check_record(&bytes, 0), Err(FrameFault::BadLength { total : 11, expected : 10 }));
  }

  #[test]
  fn bad_trailer() {
    let mut words = record(1);
    let last = words.len() - 1;
    words[last] = 0;
    let bytes = words_to_bytes(&words);
    assert_eq!(check_record(&bytes, 0), Err(FrameFault::BadTrailer(0)));
  }

  #[test]
  fn record_beyond_region() {
    let words = record(4);
    let bytes = words_to_bytes(&words[0..8]);
    assert_eq!(check_record(&bytes, 0), Err(FrameFault::Overrun { total : 11 }));
  }

  #[test]
  fn two_word_payload_is_nine_words() {
    let words = build_record([1, 1, 0, 0], &[0xAA, 0xBB]);
    assert_eq!(words.len(), 9);
    let mut bytes = words_to_bytes(&words);
    bytes.resize(256, 0);
    let framed = scan(&bytes, 0, 0);
    assert_eq!(framed.events, vec![EventDescriptor::new(0, 0, 36)]);
  }

  #[test]
  fn xor_of_words() {
    let bytes = words_to_bytes(&[0xF0F0_0000, 0x0F0F_0000, 0x1]);
    assert_eq!(xor_words(&bytes), 0xFFFF_0001);
  }
}
