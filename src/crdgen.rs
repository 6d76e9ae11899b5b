use kube::CustomResourceExt;

use capp_controller::crd::{Capp, CappConfig};

fn main() -> anyhow::Result<()> {
    let capp = serde_yaml::to_string(&Capp::crd())?;
    let capp_config = serde_yaml::to_string(&CappConfig::crd())?;
    println!("{capp}---\n{capp_config}");
    Ok(())
}
