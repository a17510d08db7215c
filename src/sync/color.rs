use rand::{rngs::StdRng, Rng, SeedableRng};

pub const PALETTE: [&str; 8] = [
    "#e06c75", "#98c379", "#e5c07b", "#61afef",
    "#c678dd", "#56b6c2", "#d19a66", "#abb2bf",
];

/// Hands out palette colors without repeats until the palette runs dry.
/// One allocator per room session.
pub struct ColorAllocator {
    remaining: Vec<&'static str>,
    last:      Option<&'static str>,
    rng:       StdRng,
}

impl Default for ColorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorAllocator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self { remaining: Vec::with_capacity(PALETTE.len()), last: None, rng }
    }

    pub fn next(&mut self) -> &'static str {
        let refilled = self.remaining.is_empty();
        if refilled {
            self.remaining.extend_from_slice(&PALETTE);
        }

        // the first draw of a new cycle must not echo the previous cycle's last color
        let idx = match self.last.filter(|_| refilled) {
            Some(prev) => {
                let pick = self.rng.gen_range(0..self.remaining.len() - 1);
                let skip = self.remaining.iter().position(|c| *c == prev);
                match skip {
                    Some(s) if pick >= s => pick + 1,
                    _ => pick,
                }
            }
            None => self.rng.gen_range(0..self.remaining.len()),
        };

        let color = self.remaining.swap_remove(idx);
        self.last = Some(color);
        color
    }
}
