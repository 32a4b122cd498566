use rand::Rng;

/// The transfer-code dictionary. Frozen: codes are only portable between
/// implementations that agree on this exact list.
pub const WORDS: [&str; 24] = [
    "acorn", "badger", "cedar", "delta", "ember", "fjord", "gorse", "heron",
    "inlet", "juniper", "kelp", "lark", "maple", "newt", "otter", "pine",
    "quartz", "reed", "sorrel", "thistle", "umber", "vole", "willow", "yarrow",
];

/// Generates a `<num>-<word>-<word>` transfer code. `num` is uniform in
/// `[0, 100)`; the words are drawn uniformly with replacement. Uniqueness is
/// probabilistic, not enforced; the sender address disambiguates collisions
/// on the receive side.
pub fn transfer_code<R: Rng>(rng: &mut R) -> String {
    let num = rng.gen_range(0..100u32);
    let a = WORDS[rng.gen_range(0..WORDS.len())];
    let b = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{num}-{a}-{b}")
}
