//! APDU classification: map a command header to an instruction name and its
//! ISO 7816-3 transport case.
//!
//! The instruction tables are JSON, keyed by hex INS with `{name, case}`
//! values, and are grouped into profiles by CLA ranges. A class match selects
//! the table whose masked CLA equals the request CLA; the first match wins.
//! Case 5 marks instructions whose case depends on P1/P2 and is resolved by
//! the class match's helper before it ever reaches a caller.

use std::{collections::HashMap, sync::LazyLock};

use serde::Deserialize;

/// One instruction table entry as found in the JSON files.
#[derive(Clone, Debug, Deserialize)]
pub struct InsEntry {
    pub name: String,
    pub case: u8,
}

type InsTable = HashMap<u8, InsEntry>;

/// The name reported when no table knows the instruction.
pub const UNKNOWN_INS: &str = "UNKNOWN";

/// Profile used when the caller does not pick one.
pub const DEFAULT_PROFILE: &str = "UICC+SIM";

/// Classifier verdict for one command header. `case == 0` means the
/// instruction (or its case) could not be determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub name: &'static str,
    pub case: u8,
}

/// Resolves a case-5 entry into 1..=4 (or 0) from the full header.
pub type CaseHelper = fn(&[u8; 5]) -> u8;

#[derive(Clone, Copy)]
struct ClassMatch {
    cla: u8,
    mask: u8,
    table: &'static InsTable,
    helper: Option<CaseHelper>,
}

/// A named set of class matches, scanned in declared order.
pub struct Profile {
    name: &'static str,
    description: &'static str,
    matches: Vec<ClassMatch>,
}

fn load_table(raw: &str) -> InsTable {
    let by_hex: HashMap<String, InsEntry> =
        serde_json::from_str(raw).expect("malformed instruction table");
    by_hex
        .into_iter()
        .map(|(k, v)| {
            let ins = u8::from_str_radix(&k, 16).expect("bad INS key");
            (ins, v)
        })
        .collect()
}

static ISO7816_INS: LazyLock<InsTable> =
    LazyLock::new(|| load_table(include_str!("instructions/iso7816_ins.json")));
static GSM1111_INS: LazyLock<InsTable> =
    LazyLock::new(|| load_table(include_str!("instructions/gsm1111_ins.json")));
static UICC_INS_046: LazyLock<InsTable> =
    LazyLock::new(|| load_table(include_str!("instructions/uicc_ins_046.json")));
static UICC_INS_8CE: LazyLock<InsTable> =
    LazyLock::new(|| load_table(include_str!("instructions/uicc_ins_8ce.json")));
static UICC_INS_80: LazyLock<InsTable> =
    LazyLock::new(|| load_table(include_str!("instructions/uicc_ins_80.json")));

/// TS 102 221: MANAGE SECURE CHANNEL and TRANSACT DATA encode the data
/// direction in P1/P2, so their transport case is not static.
fn uicc_046_case_helper(header: &[u8; 5]) -> u8 {
    let (ins, p1, p2) = (header[1], header[2], header[3]);
    match ins {
        // MANAGE SECURE CHANNEL
        0x73 => {
            if p1 == 0x00 {
                // Retrieve UICC Endpoints
                return 2;
            }
            match p1 & 0x07 {
                // Establish SA (master / connection) or Start secure channel
                1 | 2 | 3 => {
                    let p2_cmd = p2 >> 5;
                    if p2 == 0x80 || p2_cmd == 0 {
                        3
                    } else if p2_cmd == 1 || p2_cmd == 5 {
                        2
                    } else {
                        0
                    }
                }
                // Terminate secure channel SA
                4 => 3,
                _ => 0,
            }
        }
        // TRANSACT DATA: P1 bit 3 flags command data
        0x75 => {
            if p1 & 0x04 != 0 {
                3
            } else {
                2
            }
        }
        _ => 0,
    }
}

static PROFILES: LazyLock<Vec<Profile>> = LazyLock::new(|| {
    let iso: &'static InsTable = &ISO7816_INS;
    let gsm: &'static InsTable = &GSM1111_INS;
    let uicc_046: &'static InsTable = &UICC_INS_046;
    let uicc_8ce: &'static InsTable = &UICC_INS_8CE;
    let uicc_80: &'static InsTable = &UICC_INS_80;

    let gsm_matches = vec![ClassMatch {
        cla: 0xa0,
        mask: 0xff,
        table: gsm,
        helper: None,
    }];

    let uicc_matches = vec![
        ClassMatch {
            cla: 0x80,
            mask: 0xff,
            table: uicc_80,
            helper: None,
        },
        ClassMatch {
            cla: 0x00,
            mask: 0xf0,
            table: uicc_046,
            helper: Some(uicc_046_case_helper),
        },
        ClassMatch {
            cla: 0x40,
            mask: 0xf0,
            table: uicc_046,
            helper: Some(uicc_046_case_helper),
        },
        ClassMatch {
            cla: 0x60,
            mask: 0xf0,
            table: uicc_046,
            helper: Some(uicc_046_case_helper),
        },
        ClassMatch {
            cla: 0x80,
            mask: 0xf0,
            table: uicc_8ce,
            helper: None,
        },
        ClassMatch {
            cla: 0xc0,
            mask: 0xf0,
            table: uicc_8ce,
            helper: None,
        },
        ClassMatch {
            cla: 0xe0,
            mask: 0xf0,
            table: uicc_8ce,
            helper: None,
        },
    ];

    vec![
        Profile {
            name: "ISO 7816-4",
            description: "ISO 7816-4",
            matches: vec![
                ClassMatch {
                    cla: 0x00,
                    mask: 0xf0,
                    table: iso,
                    helper: None,
                },
                // 0x80/0x90
                ClassMatch {
                    cla: 0x80,
                    mask: 0xe0,
                    table: iso,
                    helper: None,
                },
                ClassMatch {
                    cla: 0xb0,
                    mask: 0xf0,
                    table: iso,
                    helper: None,
                },
                ClassMatch {
                    cla: 0xc0,
                    mask: 0xf0,
                    table: iso,
                    helper: None,
                },
            ],
        },
        Profile {
            name: "GSM SIM",
            description: "GSM/3GPP TS 11.11",
            matches: gsm_matches.clone(),
        },
        Profile {
            name: "UICC",
            description: "TS 102 221 / 3GPP TS 31.102",
            matches: uicc_matches.clone(),
        },
        Profile {
            name: "UICC+SIM",
            description: "TS 102 221 / 3GPP TS 31.102 + GSM TS 11.11",
            matches: [gsm_matches, uicc_matches].concat(),
        },
    ]
});

/// All built-in profiles, in registration order.
pub fn profiles() -> &'static [Profile] {
    &PROFILES
}

impl Profile {
    /// Look a built-in profile up by name.
    pub fn named(name: &str) -> Option<&'static Profile> {
        PROFILES.iter().find(|p| p.name == name)
    }

    /// The default profile ([`DEFAULT_PROFILE`]).
    pub fn standard() -> &'static Profile {
        Profile::named(DEFAULT_PROFILE).expect("default profile registered")
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Classify one command header. The first class match whose masked CLA
    /// equals the request CLA decides; a miss inside that table is UNKNOWN.
    pub fn classify(&self, header: &[u8; 5]) -> Classification {
        let (cla, ins) = (header[0], header[1]);
        for m in &self.matches {
            if cla & m.mask != m.cla {
                continue;
            }
            let Some(entry) = m.table.get(&ins) else {
                break;
            };
            let mut case = entry.case;
            if case == 5 {
                case = m.helper.map_or(0, |helper| helper(header));
            }
            if (1..=4).contains(&case) {
                return Classification {
                    name: entry.name.as_str(),
                    case,
                };
            }
            return Classification {
                name: entry.name.as_str(),
                case: 0,
            };
        }
        Classification {
            name: UNKNOWN_INS,
            case: 0,
        }
    }
}
