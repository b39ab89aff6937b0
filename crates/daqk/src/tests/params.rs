use crate::message::Message;
use crate::object::Object;
use crate::params::{cfg_bool, cfg_double, cfg_int, cfg_str, create_param, destroy_param, par, set_param, MapParams};
use crate::sync::Arc;
use crate::unit::{Unit, UnitRunnable};

use super::Recorder;

#[test]
fn parameters_are_child_nodes() {
    let unit = Unit::new("Adc", Recorder::default());
    let u = unit.get().unwrap();

    let rate = create_param(u, "rate", 100);
    assert_eq!(u.core().num_children(), 1);
    assert_eq!(rate.core().unwrap().path(), "Adc/rate");
    assert!(par(u, "rate").ptr_eq(&rate));

    assert!(set_param(u, "rate", 250));
    assert_eq!(rate.get().unwrap().value().as_int(), Some(250));
    assert!(!set_param(u, "missing", 1));

    // Creating again updates in place.
    let again = create_param(u, "rate", 300);
    assert!(again.ptr_eq(&rate));
    assert_eq!(u.core().num_children(), 1);

    assert!(destroy_param(u, "rate"));
    assert!(par(u, "rate").is_null());
    assert!(!destroy_param(u, "rate"));
}

#[test]
fn lookup_order_is_message_param_holder_master() {
    let master = Unit::new("Master", Recorder::default());
    let unit = Unit::new("Child", Recorder::default());
    let u = unit.get().unwrap();

    create_param(master.get().unwrap(), "depth", 4);
    create_param(master.get().unwrap(), "gain", 1.5);
    u.set_config_master(Some(&master.unit_ref()));

    let holder = Arc::new(MapParams::new());
    holder.insert("gain", 2.0);
    holder.insert("Child/mode", "fast");
    holder.insert("mode", "slow");
    u.shared().set_param_holder(Some(holder));

    assert_eq!(cfg_int(u, "depth", None, 0), 4);
    assert_eq!(cfg_double(u, "gain", None, 0.0), 2.0);
    assert_eq!(cfg_str(u, "mode", None, ""), "fast");
    assert!(!cfg_bool(u, "verbose", None, false));

    create_param(u, "gain", 3.0);
    assert_eq!(cfg_double(u, "gain", None, 0.0), 3.0);

    let msg = Message::new("Start").with("gain", 4.0);
    assert_eq!(cfg_double(u, "gain", Some(&msg), 0.0), 4.0);
}

#[test]
fn master_cycle_ends_in_default() {
    let a = Unit::new("A", Recorder::default());
    let b = Unit::new("B", Recorder::default());
    a.get().unwrap().set_config_master(Some(&b.unit_ref()));
    b.get().unwrap().set_config_master(Some(&a.unit_ref()));

    assert_eq!(cfg_int(a.get().unwrap(), "missing", None, 9), 9);
}
