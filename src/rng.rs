use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use uuid::Builder;

#[derive(Clone, Debug)]
pub struct GameRng {
    inner: StdRng,
}

impl GameRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_os() -> Self {
        Self {
            inner: StdRng::from_os_rng(),
        }
    }

    pub fn int(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        self.inner.random_range(min..=max)
    }

    pub fn bool(&mut self, probability: f64) -> bool {
        self.inner.random_bool(probability.clamp(0.0, 1.0))
    }

    pub fn coin_flip(&mut self) -> bool {
        self.bool(0.5)
    }

    pub fn pick_index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.inner.random_range(0..len)
    }

    pub fn token(&mut self, len: usize) -> String {
        (&mut self.inner)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    pub fn uuid(&mut self) -> String {
        let bytes: [u8; 16] = self.inner.random();
        Builder::from_random_bytes(bytes).into_uuid().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_produces_same_sequence() {
        let mut a = GameRng::new(7);
        let mut b = GameRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.int(0, 100), b.int(0, 100));
        }
        assert_eq!(a.uuid(), b.uuid());
    }

    #[test]
    fn int_and_pick_index_handle_degenerate_ranges() {
        let mut rng = GameRng::new(1);
        assert_eq!(rng.int(5, 5), 5);
        assert_eq!(rng.int(5, 1), 5);
        assert_eq!(rng.pick_index(0), 0);
        assert_eq!(rng.pick_index(1), 0);
        for _ in 0..100 {
            assert!(rng.pick_index(3) < 3);
        }
    }

    #[test]
    fn coin_flip_lands_on_both_sides() {
        let mut rng = GameRng::new(99);
        let heads = (0..1_000).filter(|_| rng.coin_flip()).count();
        assert!(heads > 350 && heads < 650, "heads = {heads}");
    }

    #[test]
    fn token_is_alphanumeric_with_requested_length() {
        let mut rng = GameRng::new(3);
        let token = rng.token(10);
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }
}
