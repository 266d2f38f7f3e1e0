//! Partition and voting property tests: seeded, randomized validation of
//! planner and reducer invariants across generated inputs.
//!
//! Tests verify:
//! - Shards plus unassigned images are exactly the corpus, with no image twice
//! - Every image sits in the shard of the key it starts with
//! - A full key alphabet leaves nothing unassigned
//! - The vote winner is the same under every order of the candidates
//! - A reduction is the same under any order of runs and of records in a run

use std::collections::HashSet;

use coordination::corpus::{plan_shards, ImageRecord};
use coordination::ensemble::Candidate;
use coordination::{
    CaptionResult, EnsembleReducer, ImageId, RunOutput, VotingProtocol, VotingStrategy,
};

const SEEDS: [u64; 8] = [1, 7, 42, 99, 1234, 31337, 271828, 4_000_000_007];
const NAME_CHARS: &[u8] = b"0123456789abcdefXYZ_-";
const WORDS: [&str; 8] = ["a", "dog", "cat", "on", "the", "grass", "red", "sitting"];

/// Small deterministic generator so failures replay from the seed
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

/// Distinct image ids of length 1..=5
fn corpus(rng: &mut Lcg, size: usize) -> Vec<ImageRecord> {
    let mut ids = HashSet::new();
    while ids.len() < size {
        let len = 1 + rng.below(5);
        let id: String = (0..len)
            .map(|_| NAME_CHARS[rng.below(NAME_CHARS.len())] as char)
            .collect();
        ids.insert(id);
    }
    let mut ids: Vec<String> = ids.into_iter().collect();
    ids.sort();
    ids.into_iter()
        .map(|id| {
            let path = format!("/corpus/{}.jpg", id);
            ImageRecord::new(id, path)
        })
        .collect()
}

/// Distinct keys of one length, so no key prefixes another
fn alphabet(rng: &mut Lcg, key_len: usize) -> Vec<String> {
    let count = 1 + rng.below(12);
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..count * 4 {
        let key: String = (0..key_len)
            .map(|_| NAME_CHARS[rng.below(16)] as char)
            .collect();
        if seen.insert(key.clone()) {
            keys.push(key);
        }
        if keys.len() == count {
            break;
        }
    }
    keys
}

fn caption(rng: &mut Lcg) -> String {
    let len = 1 + rng.below(5);
    (0..len)
        .map(|_| WORDS[rng.below(WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

// ── Property: shards partition the corpus ──────────────────────────

#[test]
fn prop_partition_complete_and_disjoint() {
    for seed in SEEDS {
        for key_len in [1, 2] {
            let mut rng = Lcg(seed);
            let size = 5 + rng.below(60);
            let images = corpus(&mut rng, size);
            let keys = alphabet(&mut rng, key_len);
            let plan = plan_shards(images.clone(), &keys);

            assert_eq!(plan.shards.len(), keys.len(), "seed={}: one shard per key", seed);

            let mut seen: HashSet<&str> = HashSet::new();
            for image in plan.shards.iter().flat_map(|s| &s.images).chain(&plan.unassigned) {
                assert!(
                    seen.insert(image.image_id.as_str()),
                    "seed={}, keys={:?}: {} placed twice",
                    seed,
                    keys,
                    image.image_id
                );
            }
            let corpus_ids: HashSet<&str> = images.iter().map(|i| i.image_id.as_str()).collect();
            assert_eq!(seen, corpus_ids, "seed={}, keys={:?}: union differs", seed, keys);
        }
    }
}

// ── Property: placement follows the keys ───────────────────────────

#[test]
fn prop_partition_respects_keys() {
    for seed in SEEDS {
        let mut rng = Lcg(seed);
        let images = corpus(&mut rng, 40);
        let key_len = 1 + rng.below(2);
        let keys = alphabet(&mut rng, key_len);
        let plan = plan_shards(images, &keys);

        for (shard, key) in plan.shards.iter().zip(&keys) {
            assert_eq!(&shard.key, key, "seed={}: shard order follows key order", seed);
            for image in &shard.images {
                assert!(image.image_id.starts_with(key.as_str()), "seed={}", seed);
            }
        }
        for image in &plan.unassigned {
            assert!(
                keys.iter().all(|k| !image.image_id.starts_with(k.as_str())),
                "seed={}: {} matches a key but is unassigned",
                seed,
                image.image_id
            );
        }
    }
}

#[test]
fn prop_full_alphabet_leaves_nothing_unassigned() {
    let keys: Vec<String> = NAME_CHARS.iter().map(|c| (*c as char).to_string()).collect();
    for seed in SEEDS {
        let mut rng = Lcg(seed);
        let images = corpus(&mut rng, 50);
        let plan = plan_shards(images, &keys);
        assert!(plan.unassigned.is_empty(), "seed={}", seed);
        assert_eq!(plan.total_images(), 50, "seed={}", seed);
    }
}

// ── Property: voting ignores candidate order ───────────────────────

#[test]
fn prop_vote_winner_invariant_under_permutation() {
    for seed in SEEDS {
        let mut rng = Lcg(seed);
        for _ in 0..10 {
            let size = 1 + rng.below(5);
            // Few distinct captions so repeats and ties are common
            let pool: Vec<String> = (0..1 + rng.below(3)).map(|_| caption(&mut rng)).collect();
            let group: Vec<Candidate> = (0..size)
                .map(|run| Candidate::new(run, pool[rng.below(pool.len())].clone()))
                .collect();

            for strategy in [VotingStrategy::Majority, VotingStrategy::TokenOverlap] {
                let protocol = VotingProtocol::new(strategy, 2);
                let reference = protocol.vote("img", &group).unwrap();
                assert!(group.iter().any(|c| c.caption == reference.winner));

                for order in permutations(&group) {
                    let outcome = protocol.vote("img", &order).unwrap();
                    assert_eq!(
                        outcome.winner, reference.winner,
                        "seed={}, strategy={}, group={:?}",
                        seed, strategy, group
                    );
                    assert_eq!(outcome.score, reference.score);
                    assert_eq!(outcome.votes, reference.votes);
                    assert_eq!(outcome.tie_broken, reference.tie_broken);
                }
            }
        }
    }
}

// ── Property: reduction ignores run and record order ───────────────

#[test]
fn prop_reduce_invariant_under_run_order() {
    for seed in SEEDS {
        let mut rng = Lcg(seed);
        let ids: Vec<ImageId> = (0..20).map(|i| format!("img{:02}", i)).collect();
        let run_count = 2 + rng.below(3);

        let mut runs: Vec<RunOutput> = Vec::new();
        for run in 0..run_count {
            let mut results = Vec::new();
            for id in &ids {
                // Run 0 covers everything; later runs drop some images
                if run == 0 || rng.below(4) != 0 {
                    results.push(CaptionResult::new(id, caption(&mut rng)));
                }
            }
            runs.push(RunOutput::new(run, results));
        }

        let reducer = EnsembleReducer::default();
        let reference = reducer.reduce(&runs, Some(&ids)).unwrap();

        for _ in 0..6 {
            rng.shuffle(&mut runs);
            for run in &mut runs {
                rng.shuffle(&mut run.results);
            }
            let again = reducer.reduce(&runs, Some(&ids)).unwrap();
            assert_eq!(again.submission, reference.submission, "seed={}", seed);
            let partial = |r: &coordination::ReduceReport| -> Vec<(ImageId, Vec<usize>)> {
                r.partial
                    .iter()
                    .map(|p| (p.image_id.clone(), p.runs_present.clone()))
                    .collect()
            };
            assert_eq!(partial(&again), partial(&reference), "seed={}", seed);
        }
    }
}
