use ahash::RandomState;

use crate::datum::Datum;

/// State used for all hashing operations during execution.
///
/// Seeds are fixed so hashes agree across workers and across spill
/// round-trips.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Get the partition to use for a hash.
///
/// This should be used for hash repartitions, spill batch selection, and
/// whatever else requires consistent hash to partition mappings.
pub const fn partition_for_hash(hash: u64, partitions: usize) -> usize {
    hash as usize % partitions
}

/// Combines two hashes into one hash.
pub const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

/// All nulls hash to the same value.
///
/// _What_ that value is is arbitrary, but it needs to be consistent.
pub fn null_hash_value() -> u64 {
    HASH_RANDOM_STATE.hash_one(1)
}

/// Hash a single datum.
///
/// Dispatch is an explicit per-type table; each type selects exactly one arm.
pub fn hash_datum(datum: &Datum) -> u64 {
    match datum {
        Datum::Null => null_hash_value(),
        Datum::Boolean(v) => HASH_RANDOM_STATE.hash_one(v),
        Datum::Int32(v) => HASH_RANDOM_STATE.hash_one(*v as i64),
        Datum::Int64(v) => HASH_RANDOM_STATE.hash_one(v),
        Datum::Float64(v) => HASH_RANDOM_STATE.hash_one(v.to_ne_bytes()),
        Datum::Utf8(v) => HASH_RANDOM_STATE.hash_one(v.as_bytes()),
        Datum::Binary(v) => HASH_RANDOM_STATE.hash_one(v.as_slice()),
        Datum::List(v) => {
            let mut hash = HASH_RANDOM_STATE.hash_one(v.len());
            for elem in v {
                hash = combine_hashes(hash_datum(elem), hash);
            }
            hash
        }
    }
}

/// Hash a sequence of datums as one composite key.
pub fn hash_datums(datums: &[Datum]) -> u64 {
    let mut hash = 0;
    for (idx, datum) in datums.iter().enumerate() {
        if idx == 0 {
            hash = hash_datum(datum);
        } else {
            hash = combine_hashes(hash_datum(datum), hash);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_widths_hash_alike() {
        // Int32 and Int64 carrying the same value must land in the same
        // partition so mixed-width grouping keys repartition consistently.
        assert_eq!(hash_datum(&Datum::Int32(7)), hash_datum(&Datum::Int64(7)));
    }

    #[test]
    fn nulls_hash_consistently() {
        assert_eq!(hash_datum(&Datum::Null), hash_datum(&Datum::Null));
        assert_ne!(hash_datum(&Datum::Null), hash_datum(&Datum::Int64(1)));
    }

    #[test]
    fn composite_key_order_matters() {
        let ab = hash_datums(&[Datum::Int64(1), Datum::Int64(2)]);
        let ba = hash_datums(&[Datum::Int64(2), Datum::Int64(1)]);
        assert_ne!(ab, ba);
    }
}
