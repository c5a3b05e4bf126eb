//! Adaptive video pipeline.
//!
//! | Module      | Context | Contents                                        |
//! |-------------|---------|-------------------------------------------------|
//! | `source`    | capture | `WindowSource`: damage batching, routing, AV-sync |
//! | `pipeline`  | encode  | `WindowVideoEncoder`: csc + encoder lifecycle   |
//! | `scoring`   | encode  | `PipelineScorer`                                |
//! | `scaling`   | encode  | `ScalingDecider`                                |
//! | `subregion` | capture | `VideoSubregion` detection and refresh          |
//! | `scroll`    | encode  | `ScrollData` row-hash scroll detection          |
//! | `batch`     | capture | `BatchConfig` and the delay factors             |
//! | `stats`     | capture | `WindowStats` rolling windows                   |
//! | `cancel`    | both    | `SequenceGate`                                  |
//! | `timer`     | both    | `TimerQueue` min-heap                           |

pub mod batch;
pub mod cancel;
pub mod pipeline;
pub mod scaling;
pub mod scoring;
pub mod scroll;
pub mod source;
pub mod stats;
pub mod subregion;
pub mod timer;
