// Copyright 2025 Remora Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Remora CLI
//!
//! Command-line front-end for Remora.
//!
//! ## Key Commands
//!
//! - `remora serve`: run the demo service (`echo`, `upload`, `download`)
//! - `remora call`: call one endpoint of the demo service and print the result
//! - `remora ping`: measure the round trip to a server
//!
//! The demo service lives in [`demo`] so the binary and the tests share one
//! definition of its endpoints.

pub mod demo;
