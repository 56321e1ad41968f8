//! Print wire vectors for clients implemented outside this workspace.
//!
//! Run with: cargo run --package cfdevd-protocol --example wire_vectors

use std::net::Ipv4Addr;

use cfdevd_protocol::{AddIpAlias, Greeting, RemoveIpAlias, Uninstall, WireCommand};

fn main() {
    print_vector("greeting", &Greeting::current().encode());

    print_vector("uninstall", &Uninstall.encode_frame());

    print_vector(
        "remove_ip_alias",
        &RemoveIpAlias::new(Ipv4Addr::new(10, 144, 0, 34)).encode_frame(),
    );

    match AddIpAlias::new(Ipv4Addr::new(10, 144, 0, 34), Ipv4Addr::BROADCAST) {
        Ok(cmd) => print_vector("add_ip_alias", &cmd.encode_frame()),
        Err(e) => eprintln!("add_ip_alias: {}", e),
    }
}

fn print_vector(name: &str, bytes: &[u8]) {
    print!("{:<16} ", name);
    for b in bytes {
        print!("{:02x}", b);
    }
    println!();
}
