use crate::{hash256_from_hex, Hash256, ZERO_HASH};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

impl Network {
    pub fn id(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    /// Target seconds between blocks (network rule).
    pub pow_target_spacing: i64,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// The 4-byte message-start magic prefixed to every wire message.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub consensus: ConsensusParams,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Main => ChainParams {
            network,
            message_start: [0xe3, 0xe1, 0xf3, 0xe8],
            default_port: 8333,
            dns_seeds: &[
                "seed.bitcoinabc.org",
                "seed-abc.bitcoinforks.org",
                "btccash-seeder.bitcoinunlimited.info",
            ],
            consensus: ConsensusParams {
                hash_genesis_block: hash256_from_hex(
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                )
                .unwrap_or(ZERO_HASH),
                pow_target_spacing: 10 * 60,
            },
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0xf4, 0xe5, 0xf3, 0xf4],
            default_port: 18333,
            dns_seeds: &["testnet-seed.bitcoinabc.org", "testnet-seed.bitcoinunlimited.info"],
            consensus: ConsensusParams {
                hash_genesis_block: hash256_from_hex(
                    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                )
                .unwrap_or(ZERO_HASH),
                pow_target_spacing: 10 * 60,
            },
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xda, 0xb5, 0xbf, 0xfa],
            default_port: 18444,
            dns_seeds: &[],
            consensus: ConsensusParams {
                hash_genesis_block: hash256_from_hex(
                    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                )
                .unwrap_or(ZERO_HASH),
                pow_target_spacing: 10 * 60,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_magics() {
        let main = chain_params(Network::Main);
        let test = chain_params(Network::Testnet);
        let reg = chain_params(Network::Regtest);
        assert_ne!(main.message_start, test.message_start);
        assert_ne!(main.message_start, reg.message_start);
        assert_ne!(test.message_start, reg.message_start);
    }

    #[test]
    fn genesis_hashes_parse() {
        for network in [Network::Main, Network::Testnet, Network::Regtest] {
            assert_ne!(chain_params(network).consensus.hash_genesis_block, ZERO_HASH);
        }
    }
}
