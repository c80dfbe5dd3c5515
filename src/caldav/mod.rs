// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

pub mod client;
pub mod ical;

pub use client::{FetchedEvent, GuardedClient, PutMode, PutOutcome, is_invalid_sync_token};
pub use ical::{ParsedEvent, parse_event};
