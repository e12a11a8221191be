/*!
# SmartSensor DevKit - Utilitaires pour Développement

Bibliothèque facilitant le développement autour de la gateway SmartSensor :
- Builders de frames device au format wire (TPMS, environnemental)
- Flotte de capteurs simulée pour tester l'ingestion sans broker
*/

pub mod frames;
pub mod test_utils;

pub use frames::FrameBuilder;
pub use test_utils::{DeviceFleet, InboundFrame};
