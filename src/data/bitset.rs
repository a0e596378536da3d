use std::fmt;

use nom::{
    Err, IResult,
    error::{Error, ErrorKind},
    number::complete as number,
};

use crate::messages::{ByteOrder, WireBuffer, parse_count, parse_u64};

/// Growable set of element indices, as exchanged in GET/PUT/MONITOR payloads
///
/// Bit 0 addresses a whole structure, the following bits address its elements
/// in depth-first order.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        BitSet::default()
    }

    /// A set with bits `0..count` set
    pub fn all(count: usize) -> Self {
        let mut bits = BitSet::new();
        bits.set_range(0, count);
        bits
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    /// Set bits `start..end`
    pub fn set_range(&mut self, start: usize, end: usize) {
        for index in start..end {
            self.set(index);
        }
    }

    /// Clear bits `start..end`
    pub fn clear_range(&mut self, start: usize, end: usize) {
        for index in start..end {
            self.clear(index);
        }
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Bits present in both sets
    pub fn intersection(&self, other: &BitSet) -> BitSet {
        let mut words: Vec<u64> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        while words.last() == Some(&0) {
            words.pop();
        }
        BitSet { words }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(n, word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| n * 64 + bit)
        })
    }

    /// Number of bytes needed to hold the highest set bit
    fn byte_length(&self) -> usize {
        for (n, word) in self.words.iter().enumerate().rev() {
            if *word != 0 {
                return n * 8 + (64 - word.leading_zeros() as usize).div_ceil(8);
            }
        }
        0
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        let bytes = self.byte_length();
        buffer.put_size(Some(bytes));
        let full_words = bytes / 8;
        for word in &self.words[..full_words] {
            buffer.put_u64(*word);
        }
        if bytes % 8 != 0 {
            let last = self.words[full_words];
            for n in 0..bytes % 8 {
                buffer.put_u8((last >> (8 * n)) as u8);
            }
        }
    }

    pub fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], BitSet> {
        let (mut input, bytes) = parse_count(order, input)?;
        if bytes > input.len() {
            return Err(Err::Failure(Error::new(input, ErrorKind::Eof)));
        }
        let mut words = Vec::with_capacity(bytes.div_ceil(8));
        for _ in 0..bytes / 8 {
            let (rest, word) = parse_u64(order, input)?;
            words.push(word);
            input = rest;
        }
        if bytes % 8 != 0 {
            let mut last = 0u64;
            for n in 0..bytes % 8 {
                let (rest, byte) = number::u8(input)?;
                last |= (byte as u64) << (8 * n);
                input = rest;
            }
            words.push(last);
        }
        Ok((input, BitSet { words }))
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut bits = BitSet::new();
        for index in iter {
            bits.set(index);
        }
        bits
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut bits = BitSet::new();
        assert!(bits.is_empty());
        bits.set(3);
        bits.set(70);
        assert!(bits.get(3));
        assert!(!bits.get(4));
        assert!(bits.get(70));
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![3, 70]);
        bits.clear(70);
        assert_eq!(bits.cardinality(), 1);
        bits.clear_range(0, 10);
        assert!(bits.is_empty());
        assert_eq!(BitSet::all(3), [0, 1, 2].into_iter().collect());
    }

    #[test]
    fn wire_layout() {
        // Two bytes, sent individually
        let bits: BitSet = [0, 9].into_iter().collect();
        let mut buffer = WireBuffer::new(ByteOrder::Big);
        bits.write(&mut buffer);
        assert_eq!(buffer.as_slice(), &[0x02, 0x01, 0x02]);

        // Nine bytes, a whole word in message order then one more byte
        let bits: BitSet = [1, 64].into_iter().collect();
        let mut buffer = WireBuffer::new(ByteOrder::Little);
        bits.write(&mut buffer);
        assert_eq!(
            buffer.as_slice(),
            &[0x09, 0x02, 0, 0, 0, 0, 0, 0, 0, 0x01]
        );
        let (rest, parsed) = BitSet::parse(ByteOrder::Little, buffer.as_slice()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, bits);

        let mut buffer = WireBuffer::new(ByteOrder::Big);
        BitSet::new().write(&mut buffer);
        assert_eq!(buffer.as_slice(), &[0x00]);
    }

    #[test]
    fn count_larger_than_message_is_refused() {
        // Claims 0x7FFFFFFF bytes but holds none of them
        let result = BitSet::parse(ByteOrder::Little, &[0xFE, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(matches!(result, Err(Err::Failure(_))));
        assert!(BitSet::parse(ByteOrder::Big, &[0x02, 0x01]).is_err());
    }

    #[test]
    fn combine() {
        let mut a: BitSet = [1, 2].into_iter().collect();
        let b: BitSet = [2, 100].into_iter().collect();
        assert_eq!(a.intersection(&b), [2].into_iter().collect());
        a.union_with(&b);
        assert_eq!(format!("{a:?}"), "{1, 2, 100}");
    }
}
