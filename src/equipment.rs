/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type EquipmentId = String;
pub type LocationId = String;
pub type GroupId = String;

/// The closed set of equipment kinds the orchestrator knows how to control.
/// One [`crate::algorithms::Algorithm`] implementation exists per kind (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum EquipmentKind {
    FanCoil,
    BoilerComfort,
    BoilerDomestic,
    PumpHw,
    PumpCw,
    Chiller,
    AirHandler,
    SteamBundle,
    Geothermal,
}

impl EquipmentKind {
    /// Whether this kind is dispatched in the boilers-first priority lane
    /// (§4.8 step 2).
    pub fn is_boiler(self) -> bool {
        matches!(
            self,
            EquipmentKind::BoilerComfort | EquipmentKind::BoilerDomestic
        )
    }
}

/// A stable piece of controlled equipment (§3 "Equipment"). Created once by
/// the document store, mutated by configuration writes, never destroyed by
/// the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub kind: EquipmentKind,
    pub location_id: LocationId,
    pub name: String,
    pub system: Option<String>,
    pub control_enabled: bool,
    pub group_id: Option<GroupId>,
    /// Overridable lead flag; the authoritative lead is resolved by
    /// [`crate::leadlag::GroupManager`] when the equipment belongs to a group.
    pub is_lead: Option<bool>,
}

impl Equipment {
    /// The legacy fallback assigned when an equipment id appears in the
    /// time-series store but has no document-store record (§4.2, §9). Kept
    /// and flagged rather than silently dropped, per the design note.
    pub fn placeholder(id: EquipmentId) -> Self {
        Equipment {
            id,
            kind: EquipmentKind::FanCoil,
            location_id: "4".to_string(),
            name: "Unregistered Equipment".to_string(),
            system: None,
            control_enabled: true,
            group_id: None,
            is_lead: None,
        }
    }
}

/// Closed allow-list of command names per equipment kind (§6). The extractor
/// in [`crate::algorithms`] only emits commands present in this list; unknown
/// fields returned by an algorithm are discarded.
pub fn allow_list(kind: EquipmentKind) -> &'static [&'static str] {
    match kind {
        EquipmentKind::FanCoil => &[
            "unitEnable",
            "fanEnabled",
            "fanSpeed",
            "heatingValvePosition",
            "coolingValvePosition",
            "outdoorDamperPosition",
            "temperatureSetpoint",
        ],
        EquipmentKind::BoilerComfort | EquipmentKind::BoilerDomestic => {
            &["unitEnable", "firing", "waterTempSetpoint", "isLead"]
        }
        EquipmentKind::PumpHw | EquipmentKind::PumpCw => {
            &["pumpEnable", "pumpSpeed", "isLead", "leadLagStatus"]
        }
        EquipmentKind::Chiller => &[
            "chillerEnable",
            "chillerSetpoint",
            "stage1Enabled",
            "stage2Enabled",
            "cwPumpEnable",
        ],
        EquipmentKind::AirHandler => &[
            "fanEnabled",
            "fanSpeed",
            "heatingValvePosition",
            "coolingValvePosition",
            "outdoorDamperPosition",
            "supplyAirTempSetpoint",
        ],
        EquipmentKind::SteamBundle => &[
            "primaryValvePosition",
            "secondaryValvePosition",
            "temperatureSetpoint",
            "unitEnable",
        ],
        EquipmentKind::Geothermal => &[
            "stage1Enabled",
            "stage2Enabled",
            "stage3Enabled",
            "stage4Enabled",
            "targetSetpoint",
            "loopTemp",
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_uses_legacy_defaults() {
        let eq = Equipment::placeholder("missing-1".to_string());
        assert_eq!(eq.kind, EquipmentKind::FanCoil);
        assert_eq!(eq.location_id, "4");
    }

    #[test]
    fn boiler_kinds_are_prioritized() {
        assert!(EquipmentKind::BoilerComfort.is_boiler());
        assert!(EquipmentKind::BoilerDomestic.is_boiler());
        assert!(!EquipmentKind::FanCoil.is_boiler());
    }
}
