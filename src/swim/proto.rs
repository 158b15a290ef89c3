#![allow(clippy::all)]
include!(concat!(env!("OUT_DIR"), "/swim.rs"));
