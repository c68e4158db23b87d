//! 統計情報
//!
//! キャッシュやアンワインドの動作を数え、`statistics dump` でJSONとして出力します。

use crate::errors::FailureKind;
use crate::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use yomi_async::Truncation;

/// 統計カウンタ
#[derive(Debug, Default)]
pub struct Statistics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    compilations: AtomicU64,
    discarded_compilations: AtomicU64,
    invalidations: AtomicU64,
    metadata_missing: AtomicU64,
    compile_time_us: AtomicU64,
    chains_walked: AtomicU64,
    chains_truncated: AtomicU64,
    read_failures: AtomicU64,
    corrupt_chains: AtomicU64,
    async_frames: AtomicU64,
    values: AtomicU64,
    deinitialized: AtomicU64,
    not_found: AtomicU64,
    cancellations: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Statistics {
    /// 空の統計を作成する
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    /// 生存区間表の構築1回分を記録する
    pub fn record_compilation(&self, elapsed: Duration) {
        bump(&self.compilations);
        self.compile_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// 競合に負けて捨てた構築結果を記録する
    pub fn record_discarded_compilation(&self) {
        bump(&self.discarded_compilations);
    }

    pub fn record_invalidation(&self) {
        bump(&self.invalidations);
    }

    pub fn record_metadata_missing(&self) {
        bump(&self.metadata_missing);
    }

    /// チェーン走査1回分を記録する
    pub fn record_chain(&self, frames: usize, truncation: Option<&Truncation>) {
        bump(&self.chains_walked);
        self.async_frames.fetch_add(frames as u64, Ordering::Relaxed);
        let Some(truncation) = truncation else {
            return;
        };
        bump(&self.chains_truncated);
        match FailureKind::of_truncation(truncation) {
            Some(FailureKind::MemoryReadFailure) => bump(&self.read_failures),
            Some(FailureKind::CorruptChain) => bump(&self.corrupt_chains),
            _ => {}
        }
    }

    pub fn record_value(&self) {
        bump(&self.values);
    }

    pub fn record_deinitialized(&self) {
        bump(&self.deinitialized);
    }

    pub fn record_not_found(&self) {
        bump(&self.not_found);
    }

    pub fn record_cancellation(&self) {
        bump(&self.cancellations);
    }

    /// 現在値のスナップショットを取る
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            liveness_cache: CacheStatistics {
                hits: load(&self.cache_hits),
                misses: load(&self.cache_misses),
                compilations: load(&self.compilations),
                discarded_compilations: load(&self.discarded_compilations),
                invalidations: load(&self.invalidations),
                metadata_missing: load(&self.metadata_missing),
                total_compile_time: load(&self.compile_time_us) as f64 / 1_000_000.0,
            },
            async_unwind: UnwindStatistics {
                chains_walked: load(&self.chains_walked),
                chains_truncated: load(&self.chains_truncated),
                read_failures: load(&self.read_failures),
                corrupt_chains: load(&self.corrupt_chains),
                async_frames: load(&self.async_frames),
            },
            resolutions: ResolutionStatistics {
                values: load(&self.values),
                deinitialized: load(&self.deinitialized),
                not_found: load(&self.not_found),
                cancelled: load(&self.cancellations),
            },
        }
    }

    /// JSONに整形する
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

/// 統計のスナップショット
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub liveness_cache: CacheStatistics,
    pub async_unwind: UnwindStatistics,
    pub resolutions: ResolutionStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub discarded_compilations: u64,
    pub invalidations: u64,
    pub metadata_missing: u64,
    /// 秒
    pub total_compile_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwindStatistics {
    pub chains_walked: u64,
    pub chains_truncated: u64,
    /// コンテキストが読めずに打ち切られた回数
    pub read_failures: u64,
    /// 深さ上限で打ち切られた回数
    pub corrupt_chains: u64,
    pub async_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStatistics {
    pub values: u64,
    pub deinitialized: u64,
    pub not_found: u64,
    pub cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keys_are_camel_case() {
        let stats = Statistics::new();
        stats.record_cache_miss();
        stats.record_chain(
            3,
            Some(&Truncation::ReadFailed {
                position: 3,
                address: 0x1000,
            }),
        );

        let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(json["livenessCache"]["misses"], 1);
        assert_eq!(json["asyncUnwind"]["chainsTruncated"], 1);
        assert_eq!(json["asyncUnwind"]["asyncFrames"], 3);
        assert_eq!(json["asyncUnwind"]["readFailures"], 1);
        assert_eq!(json["asyncUnwind"]["corruptChains"], 0);
        assert!(json["livenessCache"]["totalCompileTime"].is_number());
    }
}
