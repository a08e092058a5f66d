use super::*;

use serde_json::json;
use std::time::Duration;

mod support;
use support::*;

mod framing_io;
mod queue_admission;
