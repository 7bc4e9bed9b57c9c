use std::net::SocketAddr;

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Listen address, overrides `listener.addr`, --laddr "0.0.0.0:1883"
    #[structopt(name = "laddr", long)]
    pub laddr: Option<SocketAddr>,
}
