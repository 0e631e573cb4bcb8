//! The shared trading book owned by the multi-agent environment.

/// Optional starting state for a run, e.g. a user's existing holdings.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioSeed {
    pub capital: f64,
    pub shares: u64,
}

/// Cash/share book. `capital` is the initial capital the episode started
/// with and is the normalizer for return calculations; `cash` and `shares`
/// move with trades.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub capital: f64,
    pub cash: f64,
    pub shares: u64,
}

impl Portfolio {
    /// Reinitialize at episode start. A seed with existing shares gets its
    /// cash reduced by their value at the current price, mirroring a
    /// portfolio handed over mid-life.
    pub fn reset(default_capital: f64, seed: Option<PortfolioSeed>, current_price: f64) -> Self {
        match seed {
            Some(seed) => {
                let held_value = seed.shares as f64 * current_price;
                Self {
                    capital: seed.capital,
                    cash: seed.capital - held_value,
                    shares: seed.shares,
                }
            }
            None => Self {
                capital: default_capital,
                cash: default_capital,
                shares: 0,
            },
        }
    }

    pub fn value(&self, price: f64) -> f64 {
        self.cash + self.shares as f64 * price
    }
}

/// The single position all agents vote on. The book is long-only, so the
/// signal is +1 while shares are held and 0 when flat; the entry price is
/// the volume-weighted cost of the open holding and feeds only the
/// unrealized-return observation component.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedPosition {
    pub signal: i8,
    pub entry_price: f64,
}

impl SharedPosition {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn opened(entry_price: f64) -> Self {
        Self {
            signal: 1,
            entry_price,
        }
    }

    /// Fold `added` shares bought at `price` into the volume-weighted entry.
    pub fn add_lot(&mut self, held_before: u64, added: u64, price: f64) {
        if held_before == 0 || self.signal == 0 {
            *self = Self::opened(price);
        } else {
            let total = (held_before + added) as f64;
            self.entry_price =
                (self.entry_price * held_before as f64 + price * added as f64) / total;
        }
    }

    /// Unrealized return of the open position at `price`, clipped to ±1 so a
    /// runaway price cannot blow up the observation scale.
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.signal == 0 || self.entry_price <= f64::EPSILON {
            return 0.0;
        }
        let raw = self.signal as f64 * (price - self.entry_price) / self.entry_price;
        raw.clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_reset_prices_existing_shares() {
        let p = Portfolio::reset(
            1_000_000.0,
            Some(PortfolioSeed {
                capital: 500_000.0,
                shares: 100,
            }),
            1_000.0,
        );
        assert_eq!(p.shares, 100);
        assert!((p.cash - 400_000.0).abs() < 1e-9);
        assert!((p.value(1_000.0) - 500_000.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_entry_accumulates() {
        let mut pos = SharedPosition::flat();
        pos.add_lot(0, 100, 10.0);
        assert_eq!(pos.signal, 1);
        pos.add_lot(100, 100, 20.0);
        assert!((pos.entry_price - 15.0).abs() < 1e-12);
        assert!((pos.unrealized_return(18.0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn unrealized_return_is_clipped() {
        let pos = SharedPosition::opened(1.0);
        assert_eq!(pos.unrealized_return(10.0), 1.0);
    }
}
