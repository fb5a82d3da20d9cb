//! Worker statistics: wire frame and the merged local view.
//!
//! Stats frames are partial; a key absent from a frame keeps its previous
//! value, so the local view only ever moves forward on known keys.

use serde::Deserialize;

/// Fully-merged statistics for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub players: i32,
    pub playing_players: i32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: Option<FrameStats>,
    /// Round-trip latency measured locally, not part of the wire frame.
    pub ping: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Cpu {
    pub cores: i32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub sent: i32,
    pub nulled: i32,
    pub deficit: i32,
}

/// One `op = "stats"` frame; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFrame {
    pub players: Option<i32>,
    pub playing_players: Option<i32>,
    pub uptime: Option<u64>,
    pub memory: Option<MemoryFrame>,
    pub cpu: Option<CpuFrame>,
    pub frame_stats: Option<FrameStatsFrame>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFrame {
    pub free: Option<u64>,
    pub used: Option<u64>,
    pub allocated: Option<u64>,
    pub reservable: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuFrame {
    pub cores: Option<i32>,
    pub system_load: Option<f64>,
    pub lavalink_load: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStatsFrame {
    pub sent: Option<i32>,
    pub nulled: Option<i32>,
    pub deficit: Option<i32>,
}

impl NodeStats {
    /// Merge a partial frame into the local view; absent keys keep prior
    /// values.
    pub fn merge(&mut self, frame: &StatsFrame) {
        if let Some(v) = frame.players {
            self.players = v;
        }
        if let Some(v) = frame.playing_players {
            self.playing_players = v;
        }
        if let Some(v) = frame.uptime {
            self.uptime = v;
        }
        if let Some(mem) = &frame.memory {
            if let Some(v) = mem.free {
                self.memory.free = v;
            }
            if let Some(v) = mem.used {
                self.memory.used = v;
            }
            if let Some(v) = mem.allocated {
                self.memory.allocated = v;
            }
            if let Some(v) = mem.reservable {
                self.memory.reservable = v;
            }
        }
        if let Some(cpu) = &frame.cpu {
            if let Some(v) = cpu.cores {
                self.cpu.cores = v;
            }
            if let Some(v) = cpu.system_load {
                self.cpu.system_load = v;
            }
            if let Some(v) = cpu.lavalink_load {
                self.cpu.lavalink_load = v;
            }
        }
        if let Some(fs) = &frame.frame_stats {
            let merged = self.frame_stats.get_or_insert_with(FrameStats::default);
            if let Some(v) = fs.sent {
                merged.sent = v;
            }
            if let Some(v) = fs.nulled {
                merged.nulled = v;
            }
            if let Some(v) = fs.deficit {
                merged.deficit = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_prior_on_missing_keys() {
        let mut stats = NodeStats::default();
        let full: StatsFrame = serde_json::from_str(
            r#"{"players":4,"playingPlayers":2,"uptime":100,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":8,"systemLoad":0.5,"lavalinkLoad":0.1}}"#,
        )
        .unwrap();
        stats.merge(&full);
        assert_eq!(stats.players, 4);
        assert_eq!(stats.memory.reservable, 4);

        let partial: StatsFrame =
            serde_json::from_str(r#"{"players":5,"memory":{"used":9}}"#).unwrap();
        stats.merge(&partial);
        assert_eq!(stats.players, 5);
        assert_eq!(stats.playing_players, 2);
        assert_eq!(stats.memory.used, 9);
        assert_eq!(stats.memory.free, 1);
        assert_eq!(stats.cpu.cores, 8);
    }

    #[test]
    fn test_frame_stats_created_on_first_frame() {
        let mut stats = NodeStats::default();
        assert!(stats.frame_stats.is_none());
        let frame: StatsFrame =
            serde_json::from_str(r#"{"frameStats":{"sent":10,"nulled":1,"deficit":0}}"#).unwrap();
        stats.merge(&frame);
        assert_eq!(stats.frame_stats.unwrap().sent, 10);
    }
}
