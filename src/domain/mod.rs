// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types describing what the system works with:
// volumes, image/label sample pairs, fold partitions and the
// observer hooks the engines report progress through.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// A dense 3D scalar field (image intensities or label ids)
pub mod volume;

// Image/label file pairs and their train/validation partitions
pub mod sample;

// Core abstractions (traits) that other layers implement
pub mod traits;
