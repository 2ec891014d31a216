//! Prints a fresh 32-byte pre-shared key as 64 lowercase hex characters.

use clap::Parser;
use meshnet::config::KeygenArgs;
use rand::RngCore;

fn main() {
    let _args = KeygenArgs::parse();
    let mut key = [0u8; meshnet::crypto::KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    println!("{}", hex::encode(key));
}
