//! Connection list decoding.
//!
//! `GET_CONNECTION_LIST` returns entries packed four per word (short form, 8-bit entries) or two
//! per word (long form, 16-bit entries), least significant entry first. The top bit of an entry
//! marks the start of an inclusive range that ends at the following entry.

use crate::caps::ConnListLength;
use crate::verb::NodeId;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct RawEntry {
    nid: NodeId,
    range_start: bool,
}

fn raw_entries(words: &[u32], len: ConnListLength) -> impl Iterator<Item = RawEntry> + '_ {
    let (per_word, bits, range_bit) = if len.long_form {
        (2, 16, 1u32 << 15)
    } else {
        (4, 8, 1u32 << 7)
    };
    let mask = (1u32 << bits) - 1;
    words
        .iter()
        .flat_map(move |&word| (0..per_word).map(move |i| (word >> (i * bits)) & mask))
        .take(len.len)
        .map(move |entry| RawEntry {
            // Node ids are 8 bits on this link; long-form ids above that cannot be addressed.
            nid: (entry & !range_bit & 0xFF) as NodeId,
            range_start: entry & range_bit != 0,
        })
}

/// Decode the declared entries of a connection list.
///
/// A zero entry ends the list unless `zero_placeholder` is set, in which case it is kept as a
/// placeholder so later entries keep their selection index.
pub fn decode_connection_list(
    words: &[u32],
    len: ConnListLength,
    zero_placeholder: bool,
) -> Vec<NodeId> {
    let entries: Vec<RawEntry> = raw_entries(words, len).collect();
    let mut out = Vec::with_capacity(len.len);
    let mut i = 0;
    while i < entries.len() {
        let entry = entries[i];
        if entry.nid == 0 {
            if !zero_placeholder {
                break;
            }
            out.push(0);
            i += 1;
            continue;
        }
        if entry.range_start {
            if let Some(end) = entries.get(i + 1).filter(|end| end.nid >= entry.nid) {
                out.extend(entry.nid..=end.nid);
                i += 2;
                continue;
            }
        }
        out.push(entry.nid);
        i += 1;
    }
    out
}

/// Pack a connection list the way a codec reports it; ranges are not produced.
pub fn encode_connection_list(nids: &[NodeId], long_form: bool) -> Vec<u32> {
    let (per_word, bits) = if long_form { (2, 16) } else { (4, 8) };
    nids.chunks(per_word)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u32, |word, (i, &nid)| word | (u32::from(nid) << (i * bits)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn short(len: usize) -> ConnListLength {
        ConnListLength {
            len,
            long_form: false,
        }
    }

    fn long(len: usize) -> ConnListLength {
        ConnListLength {
            len,
            long_form: true,
        }
    }

    #[test]
    fn short_form_word_unpacks_low_byte_first() {
        assert_eq!(
            decode_connection_list(&[0x0403_0201], short(4), false),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn only_declared_entries_are_read() {
        assert_eq!(
            decode_connection_list(&[0x0403_0201], short(3), false),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn range_start_expands_to_next_entry() {
        // 0x82 starts a range ending at 0x05.
        assert_eq!(
            decode_connection_list(&[0x0605_8201], short(4), false),
            vec![1, 2, 3, 4, 5, 6]
        );
        // Long form: 0x8010 .. 0x0013.
        assert_eq!(
            decode_connection_list(&[0x0013_8010], long(2), false),
            vec![0x10, 0x11, 0x12, 0x13]
        );
    }

    #[test]
    fn zero_terminates_unless_placeholder() {
        let words = [0x0C00_0B0A];
        assert_eq!(decode_connection_list(&words, short(4), false), vec![0x0A, 0x0B]);
        assert_eq!(
            decode_connection_list(&words, short(4), true),
            vec![0x0A, 0x0B, 0x00, 0x0C]
        );
    }

    #[test]
    fn long_form_packs_two_per_word() {
        let words = encode_connection_list(&[0x0C, 0x0D, 0x0B], true);
        assert_eq!(words, vec![0x000D_000C, 0x0000_000B]);
        assert_eq!(
            decode_connection_list(&words, long(3), false),
            vec![0x0C, 0x0D, 0x0B]
        );
    }

    proptest! {
        #[test]
        fn plain_lists_decode_to_their_entries(
            nids in prop::collection::vec(1u8..0x80, 0..20),
            long_form in any::<bool>(),
        ) {
            let words = encode_connection_list(&nids, long_form);
            let len = ConnListLength { len: nids.len(), long_form };
            prop_assert_eq!(len.words(), words.len());
            prop_assert_eq!(decode_connection_list(&words, len, false), nids);
        }

        #[test]
        fn range_pair_expands_inclusively(
            start in 1u8..0x40,
            span in 0u8..8,
        ) {
            let end = start + span;
            let words = [u32::from(start | 0x80) | (u32::from(end) << 8)];
            let decoded = decode_connection_list(&words, short(2), false);
            prop_assert!(decoded.len() >= 2 || span == 0);
            prop_assert_eq!(decoded.len(), usize::from(span) + 1);
        }
    }
}
