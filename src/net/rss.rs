//! Receive-Side Scaling configuration.
//!
//! The RSS hash key is randomized at init so remote parties cannot predict
//! queue placement; degenerate keys (all-zero, all-one) are rejected
//! because they make the hash constant or trivially predictable. A
//! byte-swapped copy of the key is kept for software emulation of the
//! hardware hash.

use rand::Rng;

use crate::error::{Error, Result};
use crate::net::dev::EthDev;

/// Size of the secret key of the RSS hash.
pub const RSS_KEY_LEN: usize = 40;

/// Largest redirection table supported.
pub const RETA_MAX_SIZE: usize = 512;

/// The RSS hash key pair: native byte order and the big-endian conversion
/// used by the software Toeplitz implementation.
#[derive(Debug, Clone)]
pub struct RssKey {
    pub key: [u8; RSS_KEY_LEN],
    pub key_be: [u8; RSS_KEY_LEN],
}

impl RssKey {
    /// Generate a random key, retrying while the byte pair is degenerate.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut rsk1: u8 = 0;
        let mut rsk2: u8 = 0;
        while rsk1 == rsk2 && (rsk1 == 0 || rsk1 == 0xff) {
            rsk1 = rng.random();
            rsk2 = rng.random();
        }
        Self::from_pair(rsk1, rsk2)
    }

    fn from_pair(rsk1: u8, rsk2: u8) -> Self {
        let mut key = [0u8; RSS_KEY_LEN];
        for (i, b) in key.iter_mut().enumerate() {
            *b = if i % 2 == 0 { rsk1 } else { rsk2 };
        }

        // Big-endian conversion is a byte swap within each 32-bit word.
        let mut key_be = key;
        for word in key_be.chunks_exact_mut(4) {
            word.reverse();
        }

        Self { key, key_be }
    }
}

/// Program the redirection table of `dev` to spread traffic across
/// `queues`: RETA entry `i` maps to `queues[i mod n]`.
pub fn setup_rss(dev: &dyn EthDev, queues: &[u16]) -> Result<()> {
    if queues.is_empty() {
        return Err(Error::Config(format!(
            "no queues given for RSS on port {}",
            dev.name()
        )));
    }

    let reta_size = dev.reta_size() as usize;
    if reta_size == 0 {
        return Err(Error::Port {
            port: dev.name().to_string(),
            msg: "invalid RETA size = 0".into(),
        });
    }
    if reta_size > RETA_MAX_SIZE {
        return Err(Error::Port {
            port: dev.name().to_string(),
            msg: format!("invalid RETA size = {reta_size}"),
        });
    }

    let table: Vec<u16> = (0..reta_size).map(|i| queues[i % queues.len()]).collect();
    dev.update_reta(&table)?;

    // Read the table back so a silently ignored update surfaces here.
    let mut check = vec![0u16; reta_size];
    dev.query_reta(&mut check)?;
    if check != table {
        return Err(Error::Port {
            port: dev.name().to_string(),
            msg: "RETA readback does not match the programmed table".into(),
        });
    }

    Ok(())
}

/// Query the current redirection table of `dev`.
pub fn get_rss_config(dev: &dyn EthDev) -> Result<Vec<u16>> {
    let reta_size = dev.reta_size() as usize;
    if reta_size == 0 || reta_size > RETA_MAX_SIZE {
        return Err(Error::Port {
            port: dev.name().to_string(),
            msg: format!("invalid RETA size = {reta_size}"),
        });
    }
    let mut table = vec![0u16; reta_size];
    dev.query_reta(&mut table)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::SimDev;
    use std::sync::Arc;

    #[test]
    fn test_key_is_not_degenerate() {
        for _ in 0..32 {
            let key = RssKey::random();
            assert!(key.key.iter().any(|&b| b != 0));
            assert!(key.key.iter().any(|&b| b != 0xff));
        }
    }

    #[test]
    fn test_key_be_is_wordwise_swap() {
        let key = RssKey::from_pair(0x12, 0x34);
        assert_eq!(&key.key[0..4], &[0x12, 0x34, 0x12, 0x34]);
        assert_eq!(&key.key_be[0..4], &[0x34, 0x12, 0x34, 0x12]);
    }

    fn configured(dev: Arc<SimDev>) -> Arc<SimDev> {
        use crate::net::dev::{EthDev, PortConf};
        dev.configure(&PortConf {
            num_rx_queues: 8,
            num_tx_queues: 8,
            rss_key: [0xaa; RSS_KEY_LEN],
        })
        .unwrap();
        dev
    }

    #[test]
    fn test_reta_spread() {
        let dev = configured(SimDev::new("p0").with_reta_size(128));
        setup_rss(&*dev, &[3, 5, 7]).unwrap();
        let table = get_rss_config(&*dev).unwrap();
        assert_eq!(table.len(), 128);
        for (i, q) in table.iter().enumerate() {
            assert_eq!(*q, [3, 5, 7][i % 3]);
        }
    }

    #[test]
    fn test_zero_reta_size_fails() {
        let dev = configured(SimDev::new("p0").with_reta_size(0));
        assert!(setup_rss(&*dev, &[0]).is_err());
    }

    #[test]
    fn test_oversized_reta_fails() {
        let dev = configured(SimDev::new("p0").with_reta_size(1024));
        assert!(setup_rss(&*dev, &[0]).is_err());
    }
}
