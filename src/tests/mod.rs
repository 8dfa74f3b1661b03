
mod takeover;
