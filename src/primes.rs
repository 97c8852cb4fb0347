//! Prime number workload.
//!
//! A small, deterministic program to run on the traced CPU. Candidates are tested by trial
//! division with the primes found so far.

/// Number of primes found by default.
pub const TARGET_COUNT: usize = 512;

const SEEDS: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
const FIRST_CANDIDATE: u32 = 39;

pub struct PrimeGenerator {
    target_count: usize,
    primes: Vec<u32>,
    next_number: u32,
    root: u32,
}

impl PrimeGenerator {
    pub fn new(target_count: usize) -> Self {
        Self {
            target_count,
            primes: SEEDS.to_vec(),
            next_number: FIRST_CANDIDATE,
            root: 1,
        }
    }

    /// Find primes until the target count is reached. `report` is called with the running
    /// count and the value of every newly found prime. Stops early once the candidates run out
    /// of `u32`.
    pub fn calculate(&mut self, mut report: impl FnMut(usize, u32)) {
        while self.primes.len() < self.target_count {
            let number = self.next_number;
            let Some(next_number) = number.checked_add(2) else {
                break;
            };
            self.next_number = next_number;

            while u64::from(number) > u64::from(self.root) * u64::from(self.root) {
                self.root += 1;
            }

            // Candidates are odd, so division by 2 is skipped.
            for index in 1..self.primes.len() {
                let prime = self.primes[index];
                if prime > self.root {
                    self.primes.push(number);
                    report(self.primes.len(), number);
                    break;
                }
                if number % prime == 0 {
                    break;
                }
            }
        }
    }

    /// The primes found, in ascending order.
    pub fn primes(&self) -> &[u32] {
        &self.primes[..self.target_count.min(self.primes.len())]
    }
}

/// Compute the first `target_count` primes, printing each one as it is found.
pub fn calculate_primes(target_count: usize) -> Vec<u32> {
    let mut generator = PrimeGenerator::new(target_count);
    generator.calculate(|count, number| println!("prime number [{}]: {}", count, number));
    generator.primes().to_vec()
}
