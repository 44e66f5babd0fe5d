use crate::hash::{decode_hex, keccak256};

/// Compute the Merkle root of a list of `0x`-hex leaf hashes.
///
/// Leaves are sorted case-insensitively first. Internal nodes are
/// `keccak256(left || right)` over the decoded bytes; an odd tail is paired with
/// itself. A single leaf is its own root; no leaves yields `None`.
pub fn compute_merkle_root(leaves: &[String]) -> Option<String> {
    let mut sorted: Vec<String> = leaves.iter().map(|l| l.to_ascii_lowercase()).collect();
    sorted.sort();

    let mut current_level: Vec<Vec<u8>> = sorted.iter().filter_map(|l| decode_hex(l)).collect();
    if current_level.is_empty() || current_level.len() != sorted.len() {
        return None;
    }

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            let mut concatenated = Vec::with_capacity(left.len() + right.len());
            concatenated.extend_from_slice(left);
            concatenated.extend_from_slice(right);
            next_level.push(keccak256(&concatenated).to_vec());
        }

        current_level = next_level;
    }

    Some(format!("0x{}", hex::encode(&current_level[0])))
}
