//! Binary Merkle tree construction and inclusion proofs
//!
//! Internal nodes hash the sorted concatenation of their children, so proofs
//! carry no left/right orientation and verification is compatible with the
//! OpenZeppelin `processProof` convention used by the on-chain verifiers.
//! Trees are built as pure functions over a leaf-hash list; nothing persists
//! beyond the bundle describing the tree. An odd node at any level is carried
//! up unchanged.

use sha3::{Digest, Keccak256};

/// keccak256 convenience wrapper
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    output.copy_from_slice(&Keccak256::digest(data));
    output
}

fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut input = [0u8; 64];
    if a <= b {
        input[..32].copy_from_slice(a);
        input[32..].copy_from_slice(b);
    } else {
        input[..32].copy_from_slice(b);
        input[32..].copy_from_slice(a);
    }
    keccak256(&input)
}

/// Compute the root of a leaf-hash list. The empty list yields the zero root.
pub fn build_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            match pair {
                [a, b] => next.push(hash_pair(a, b)),
                [a] => next.push(*a),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    level[0]
}

/// Build the inclusion proof for `index` within the leaf-hash list
pub fn build_proof(leaves: &[[u8; 32]], index: usize) -> Vec<[u8; 32]> {
    let mut proof = Vec::new();
    if leaves.is_empty() || index >= leaves.len() {
        return proof;
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = position ^ 1;
        if sibling < level.len() {
            proof.push(level[sibling]);
        }

        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            match pair {
                [a, b] => next.push(hash_pair(a, b)),
                [a] => next.push(*a),
                _ => unreachable!(),
            }
        }
        level = next;
        position /= 2;
    }
    proof
}

/// Recompute the root implied by a leaf and its proof
pub fn process_proof(proof: &[[u8; 32]], leaf: &[u8; 32]) -> [u8; 32] {
    let mut computed = *leaf;
    for element in proof {
        computed = hash_pair(&computed, element);
    }
    computed
}

/// Check a leaf's inclusion under `root`
pub fn verify_proof(root: &[u8; 32], leaf: &[u8; 32], proof: &[[u8; 32]]) -> bool {
    process_proof(proof, leaf) == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| keccak256(format!("leaf-{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn empty_list_yields_zero_root() {
        assert_eq!(build_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaves = sample_leaves(1);
        assert_eq!(build_root(&leaves), leaves[0]);
        assert!(build_proof(&leaves, 0).is_empty());
        assert!(verify_proof(&leaves[0], &leaves[0], &[]));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=9 {
            let leaves = sample_leaves(n);
            let root = build_root(&leaves);
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = build_proof(&leaves, i);
                assert!(
                    verify_proof(&root, leaf, &proof),
                    "leaf {} of {} failed verification",
                    i,
                    n
                );
            }
        }
    }

    #[test]
    fn proof_for_wrong_leaf_fails() {
        let leaves = sample_leaves(4);
        let root = build_root(&leaves);
        let proof = build_proof(&leaves, 0);
        assert!(!verify_proof(&root, &leaves[1], &proof));
    }

    #[test]
    fn root_is_order_sensitive_but_rebuild_stable() {
        let leaves = sample_leaves(5);
        assert_eq!(build_root(&leaves), build_root(&leaves));

        let mut reversed = leaves.clone();
        reversed.reverse();
        // Same set in a different order commits to a different tree; callers
        // must sort leaves canonically before building.
        assert_ne!(build_root(&leaves), build_root(&reversed));
    }
}
