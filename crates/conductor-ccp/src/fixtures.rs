use once_cell::sync::Lazy;

use crate::packet::{Mode, Route, RouteControlRequest, RouteProp, RouteUpdateRequest};

pub static CONTROL_REQUEST: Lazy<RouteControlRequest> = Lazy::new(|| RouteControlRequest {
    mode: Mode::Sync,
    last_known_routing_table_id: [0x21; 16],
    last_known_epoch: 32,
    features: vec!["foo".to_string(), "bar".to_string()],
});

pub static UPDATE_REQUEST_SIMPLE: Lazy<RouteUpdateRequest> = Lazy::new(|| RouteUpdateRequest {
    routing_table_id: [0x21; 16],
    current_epoch_index: 52,
    from_epoch_index: 52,
    to_epoch_index: 52,
    hold_down_time: 30_000,
    speaker: "example.alice".to_string(),
    new_routes: Vec::new(),
    withdrawn_routes: Vec::new(),
});

pub static UPDATE_REQUEST_COMPLEX: Lazy<RouteUpdateRequest> = Lazy::new(|| RouteUpdateRequest {
    routing_table_id: [0xbc; 16],
    current_epoch_index: 8,
    from_epoch_index: 6,
    to_epoch_index: 8,
    hold_down_time: 45_000,
    speaker: "example.alice".to_string(),
    new_routes: vec![
        Route {
            prefix: "example.prefix1".to_string(),
            path: vec!["example.hop1".to_string()],
            auth: [0xaa; 32],
            props: Vec::new(),
        },
        Route {
            prefix: "example.prefix2".to_string(),
            path: vec![
                "example.hop1".to_string(),
                "example.hop2".to_string(),
            ],
            auth: [0xbb; 32],
            props: vec![RouteProp {
                is_optional: true,
                is_transitive: false,
                is_partial: true,
                is_utf8: false,
                id: 1,
                value: b"meta".to_vec(),
            }],
        },
    ],
    withdrawn_routes: vec![
        "example.prefix3".to_string(),
        "example.prefix4".to_string(),
    ],
});
