//! UTXO set snapshots
//!
//! File layout, all integers little-endian:
//!
//! ```text
//! magic        5 bytes  "utxo" 0xff
//! version      u16
//! network      4 bytes  disk magic of the chain
//! base hash    32 bytes block the coin set belongs to
//! coin count   u64
//! coins        outpoint hash, vout u32, CompactSize(height·2 + coinbase),
//!              value i64, CompactSize-prefixed script
//! ```
//!
//! Coins are written sorted by outpoint. The content hash is sha256d over
//! the coin records exactly as written.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::chainstate::{ChainState, ChainTip};
use crate::crypto::sha256d;
use crate::error::{SerializationError, SnapshotError};
use crate::params::ChainParams;
use crate::serialization::{encode_varint, write_var_bytes, Reader};
use crate::types::*;

pub const SNAPSHOT_MAGIC: [u8; 5] = *b"utxo\xff";
pub const SNAPSHOT_VERSION: u16 = 2;

/// Which block a dump is anchored at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// The current tip
    Latest,
    /// The latest assumeutxo height at or below the tip
    Rollback,
}

impl FromStr for SnapshotMode {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(SnapshotMode::Latest),
            "rollback" => Ok(SnapshotMode::Rollback),
            other => Err(SnapshotError::InvalidType(other.to_string())),
        }
    }
}

/// Result of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub coins_written: u64,
    pub base_height: Height,
    pub base_hash: Hash,
    pub path: PathBuf,
    pub txoutset_hash: Hash,
    /// Transactions in the chain up to the base block
    pub nchaintx: u64,
}

impl SnapshotInfo {
    /// RPC-shaped rendering with hex hashes
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "coins_written": self.coins_written,
            "base_height": self.base_height,
            "base_hash": hash_to_hex(&self.base_hash),
            "path": self.path.display().to_string(),
            "txoutset_hash": hash_to_hex(&self.txoutset_hash),
            "nchaintx": self.nchaintx,
        })
    }
}

/// A snapshot read back from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSnapshot {
    pub base_hash: Hash,
    pub coins: UtxoSet,
    pub txoutset_hash: Hash,
}

impl LoadedSnapshot {
    /// Compare the file's content hash against a trusted value
    pub fn verify(&self, expected: &Hash) -> Result<(), SnapshotError> {
        if &self.txoutset_hash != expected {
            return Err(SnapshotError::HashMismatch);
        }
        Ok(())
    }
}

/// Coin records in canonical order
fn coin_records(utxos: &UtxoSet) -> Vec<u8> {
    let mut coins: Vec<(&OutPoint, &Coin)> = utxos.iter().collect();
    coins.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Vec::with_capacity(coins.len() * 64);
    for (outpoint, coin) in coins {
        out.extend_from_slice(&outpoint.hash);
        out.extend_from_slice(&outpoint.index.to_le_bytes());
        let code = ((coin.height as u64) << 1) | coin.is_coinbase as u64;
        out.extend_from_slice(&encode_varint(code));
        out.extend_from_slice(&coin.value.to_le_bytes());
        write_var_bytes(&mut out, &coin.script_pubkey);
    }
    out
}

/// TxOutSetHash: 𝒰𝒮 → ℍ
pub fn txoutset_hash(utxos: &UtxoSet) -> Hash {
    sha256d(&coin_records(utxos))
}

fn write_snapshot(
    path: &Path,
    params: &ChainParams,
    base: &ChainTip,
    utxos: &UtxoSet,
    records: &[u8],
) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&SNAPSHOT_MAGIC)?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    writer.write_all(&params.disk_magic)?;
    writer.write_all(&base.hash)?;
    writer.write_all(&(utxos.len() as u64).to_le_bytes())?;
    writer.write_all(records)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

/// DumpTxOutSet: 𝒞𝒮 × Path × Mode → SnapshotInfo
///
/// 1. Refuse an unknown mode or an existing path
/// 2. Pick the base height: the tip, or the rollback height
/// 3. Under one read lock, rewind a copy of the coin set to the base if
///    needed and write it to `<path>.incomplete`
/// 4. Rename into place
pub fn dump_snapshot(
    chain: &ChainState,
    path: &Path,
    mode: &str,
) -> Result<SnapshotInfo, SnapshotError> {
    // 1. Arguments
    let mode = SnapshotMode::from_str(mode)?;
    if path.exists() {
        return Err(SnapshotError::PathExists(path.display().to_string()));
    }

    // 2. Base height
    let tip = chain.tip();
    let base_height = match mode {
        SnapshotMode::Latest => tip.height,
        SnapshotMode::Rollback => chain
            .params()
            .rollback_height(tip.height)
            .ok_or(SnapshotError::NoRollbackTarget(tip.height))?,
    };

    // 3. Write
    let mut temp = path.as_os_str().to_owned();
    temp.push(".incomplete");
    let temp = PathBuf::from(temp);
    let params = chain.params();
    let written = chain.with_utxos_at(base_height, |utxos, base, chain_tx| {
        let records = coin_records(utxos);
        let hash = sha256d(&records);
        write_snapshot(&temp, params, base, utxos, &records)?;
        Ok::<_, SnapshotError>((utxos.len() as u64, *base, hash, chain_tx))
    });
    // The tip only moves forward, so the base height is still present
    let (coins_written, base, txoutset_hash, nchaintx) =
        written.ok_or(SnapshotError::NoRollbackTarget(base_height))??;

    // 4. Rename
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    info!(
        path = %path.display(),
        height = base.height,
        coins = coins_written,
        hash = %hash_to_hex(&base.hash),
        "wrote UTXO snapshot"
    );

    Ok(SnapshotInfo {
        coins_written,
        base_height: base.height,
        base_hash: base.hash,
        path: path.to_path_buf(),
        txoutset_hash,
        nchaintx,
    })
}

/// LoadTxOutSet: Path → LoadedSnapshot
///
/// Checks magic, version and network, then decodes exactly the announced
/// number of coins with nothing trailing.
pub fn load_snapshot(path: &Path, params: &ChainParams) -> Result<LoadedSnapshot, SnapshotError> {
    let data = fs::read(path)?;
    let mut reader = Reader::new(&data);

    if reader.read_bytes(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
        return Err(SerializationError::BadMagic.into());
    }
    let version = reader.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(SerializationError::UnsupportedVersion(version).into());
    }
    if reader.read_bytes(4)? != params.disk_magic {
        return Err(SnapshotError::NetworkMismatch);
    }
    let base_hash = reader.read_hash()?;
    let count = reader.read_u64()?;

    let records_start = reader.position();
    let mut coins = UtxoSet::new();
    for _ in 0..count {
        let outpoint = OutPoint {
            hash: reader.read_hash()?,
            index: reader.read_u32()?,
        };
        let code = reader.read_varint()?;
        let height = Height::try_from(code >> 1)
            .map_err(|_| SerializationError::OversizedVector(code))?;
        let coin = Coin {
            value: reader.read_i64()?,
            script_pubkey: reader.read_var_bytes()?,
            height,
            is_coinbase: code & 1 == 1,
        };
        coins.insert(outpoint, coin);
    }
    reader.finish()?;

    Ok(LoadedSnapshot {
        base_hash,
        coins,
        txoutset_hash: sha256d(&data[records_start..]),
    })
}
