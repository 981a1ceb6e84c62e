// Workspace anchor crate: repo-wide tooling hooks only (cargo-husky).
// All functionality lives in crates/*.
