//! コマンドライン引数と環境変数
//!
//! 起動時に 1 回だけ読み、core の config 構造体に変換して渡します。

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use courier_core::config::{
    BrokerAddress, BrokerConfig, DEFAULT_CLIENT_ID, DEFAULT_STORE_URL, DeliveryPolicy,
    DispatchOptions, StoreConfig,
};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Publish due scheduled tasks to an MQTT broker", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// HTTP trigger: every request runs one dispatch
    Serve {
        #[arg(long, env = "COURIER_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },

    /// Run one dispatch and exit
    Run,
}

#[derive(Args)]
pub struct Settings {
    /// Task store database URL
    #[arg(long, env = "TASK_STORE_URL", default_value = DEFAULT_STORE_URL)]
    pub store_url: String,

    /// Broker address (tcp://host:port)
    #[arg(long, env = "MQTT_BROKER")]
    pub mqtt_broker: BrokerAddress,

    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    pub mqtt_client_id: String,

    /// always-advance | require-delivery
    #[arg(long, env = "COURIER_DELIVERY_POLICY", default_value_t)]
    pub delivery_policy: DeliveryPolicy,
}

impl Settings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.store_url.clone())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new(self.mqtt_broker.clone())
            .with_credentials(self.mqtt_user.clone(), self.mqtt_pass.clone())
            .with_client_id(self.mqtt_client_id.clone())
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            delivery_policy: self.delivery_policy,
            ..DispatchOptions::default()
        }
    }
}
