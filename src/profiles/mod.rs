//! Device profiles layered on [`Module`].
//!
//! Each profile binds named, validated operations to the channel numbers of one
//! module type and supplies the [`ChannelDecoder`](crate::module::ChannelDecoder)
//! that turns received tokens into typed values:
//!
//! - [`RegulatedSource`]: DCG power source/sink
//! - [`AnalogIo`]: ADA-IO analog breakout
//! - [`ElectronicLoad`]: EDL electronic load
//!
//! Profiles dereference to their [`Module`], so identity, status, calibration
//! and raw channel access stay available.

use crate::config::{CtlabConfig, ModuleDefinition, ProfileKind};
use crate::connection::Connection;
use crate::error::CtlabResult;
use crate::module::Module;
use std::sync::Arc;

/// Generates `name()`, `req_name()` and `query_name()` for read-back channels.
///
/// `$read` is the typed cache accessor on [`Module`] (`float`, `integer`, `flag`).
macro_rules! readback_channels {
    ($read:ident -> $ty:ty { $($channel:expr => $get:ident, $req:ident, $query:ident: $what:literal;)+ }) => {
        $(
            #[doc = concat!("Cached ", $what, ".")]
            pub fn $get(&self) -> $crate::error::CtlabResult<$ty> {
                self.module.$read($channel)
            }

            #[doc = concat!("Request ", $what, ".")]
            pub async fn $req(&self) -> $crate::error::CtlabResult<()> {
                self.module.req($channel).await
            }

            #[doc = concat!("Request and return ", $what, ".")]
            pub async fn $query(&self) -> $crate::error::CtlabResult<$ty> {
                self.module.refresh($channel).await?;
                self.$get()
            }
        )+
    };
}

pub mod adaio;
pub mod dcg;
pub mod edl;

pub use adaio::{AnalogGroup, AnalogIo};
pub use dcg::{DcgDisplay, DcgStatus, RegulatedSource};
pub use edl::{ElectronicLoad, LoadDisplay, LoadRange};

/// A module built from configuration.
#[derive(Debug, Clone)]
pub enum Profile {
    /// Regulated source/sink
    Dcg(RegulatedSource),
    /// Analog I/O breakout
    AdaIo(AnalogIo),
    /// Electronic load
    Edl(ElectronicLoad),
    /// Module without a profile
    Generic(Module),
}

impl Profile {
    /// Register the module described by `definition` on `connection`.
    pub fn build(definition: &ModuleDefinition, connection: &Arc<Connection>) -> CtlabResult<Self> {
        let id = definition.id;
        Ok(match definition.profile {
            ProfileKind::Dcg => Profile::Dcg(RegulatedSource::new(id, connection)?),
            ProfileKind::AdaIo => Profile::AdaIo(AnalogIo::new(id, connection)?),
            ProfileKind::Edl => Profile::Edl(ElectronicLoad::new(id, connection)?),
            ProfileKind::Generic => Profile::Generic(Module::new(id, connection)?),
        })
    }

    /// The underlying module.
    pub fn module(&self) -> &Module {
        match self {
            Profile::Dcg(dcg) => dcg.module(),
            Profile::AdaIo(io) => io.module(),
            Profile::Edl(edl) => edl.module(),
            Profile::Generic(module) => module,
        }
    }
}

/// Register every module listed in `config` on `connection`, in order.
///
/// Stops at the first failure; modules registered before it stay registered.
pub fn build_all(config: &CtlabConfig, connection: &Arc<Connection>) -> CtlabResult<Vec<Profile>> {
    config
        .modules
        .iter()
        .map(|definition| Profile::build(definition, connection))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleDefinition;
    use crate::connection::ConnectionOptions;
    use crate::mock_stream;

    #[test]
    fn builds_profiles_from_definitions() {
        let (connector, _harness) = mock_stream::connector();
        let connection = Connection::new(connector, ConnectionOptions::default());

        let mut config = CtlabConfig::default();
        config.modules = vec![
            ModuleDefinition::new(1, ProfileKind::Dcg),
            ModuleDefinition::new(2, ProfileKind::Edl),
            ModuleDefinition::new(4, ProfileKind::AdaIo),
            ModuleDefinition::new(9, ProfileKind::Generic),
        ];

        let profiles = build_all(&config, &connection).unwrap();
        let names: Vec<_> = profiles.iter().map(|p| p.module().profile()).collect();
        assert_eq!(names, vec!["dcg", "edl", "adaio", "generic"]);
        assert_eq!(connection.registry().ids(), vec![1, 2, 4, 9]);
    }

    #[test]
    fn duplicate_definition_fails() {
        let (connector, _harness) = mock_stream::connector();
        let connection = Connection::new(connector, ConnectionOptions::default());
        let definition = ModuleDefinition::new(3, ProfileKind::Dcg);

        Profile::build(&definition, &connection).unwrap();
        assert!(Profile::build(&definition, &connection).is_err());
    }
}
