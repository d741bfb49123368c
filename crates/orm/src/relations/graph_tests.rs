//! Relation graph scenario tests
//!
//! Exercises the mutation engine over a small family domain: fathers and
//! mothers with children, persons and dogs related many-to-many, optionally
//! through a junction entity.

use serde_json::{json, Map};

use crate::entity::{ClassRegistry, EntityClassDef, EntityId, RelationSlot};
use crate::error::OrmError;
use crate::relations::collection::RelatedCollection;
use crate::relations::manager::{RelationManager, RelationValue};
use crate::session::Session;

fn family_classes() -> ClassRegistry {
    let classes = ClassRegistry::new();
    classes
        .register(
            EntityClassDef::new("Person", "persons")
                .with_column("id")
                .with_declaration(
                    "dogs",
                    json!({
                        "type": "manyToMany",
                        "related.class": "Dog",
                        "related.property": "persons"
                    }),
                ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Father", "fathers")
                .with_parent("Person")
                .with_column("id")
                .with_declaration(
                    "children",
                    json!({
                        "type": "oneToMany",
                        "related.class": "Child",
                        "related.property": "father"
                    }),
                ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Mother", "mothers")
                .with_parent("Person")
                .with_column("id")
                .with_declaration(
                    "children",
                    json!({
                        "type": "oneToMany",
                        "related.class": "Child",
                        "related.property": "mother"
                    }),
                ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Child", "children")
                .with_parent("Person")
                .with_column("id")
                .with_declaration(
                    "father",
                    json!({
                        "type": "manyToOne",
                        "related.class": "Father",
                        "related.property": "children"
                    }),
                )
                .with_declaration(
                    "mother",
                    json!({
                        "type": "manyToOne",
                        "related.class": "Mother",
                        "related.property": "children"
                    }),
                ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Dog", "dogs")
                .with_column("id")
                .with_declaration(
                    "persons",
                    json!({
                        "type": "manyToMany",
                        "related.class": "Person",
                        "related.property": "dogs"
                    }),
                ),
        )
        .unwrap();
    classes
}

fn junction_classes() -> ClassRegistry {
    let classes = ClassRegistry::new();
    classes
        .register(
            EntityClassDef::new("Person", "persons")
                .with_column("id")
                .with_declaration(
                    "dogs",
                    json!({
                        "type": "manyToMany",
                        "related.class": "Dog",
                        "related.property": "persons",
                        "mid.class": "FamilyDog",
                        "mid.factory": "family_dog"
                    }),
                ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Dog", "dogs").with_column("id").with_declaration(
                "persons",
                json!({
                    "type": "manyToMany",
                    "related.class": "Person",
                    "related.property": "dogs"
                }),
            ),
        )
        .unwrap();
    classes
        .register(EntityClassDef::new("FamilyDog", "family_dogs").with_column("id"))
        .unwrap();
    classes.register_factory("family_dog", |session, _context| {
        session.new_entity("FamilyDog", Map::new())
    });
    classes
}

fn setup(classes: ClassRegistry) -> (RelationManager, Session) {
    let manager = RelationManager::new(classes.clone());
    let session = Session::new(classes);
    (manager, session)
}

fn entity(session: &mut Session, class: &str) -> EntityId {
    session.new_entity(class, Map::new()).unwrap()
}

fn collection(value: RelationValue) -> Vec<EntityId> {
    match value {
        RelationValue::Collection(ids) => ids,
        RelationValue::Single(_) => panic!("expected a collection value"),
    }
}

#[test]
fn test_one_to_many_symmetry() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let child = entity(&mut session, "Child");

    manager.set(&mut session, child, "father", Some(father)).unwrap();

    assert_eq!(
        manager.get(&mut session, child, "father").unwrap(),
        RelationValue::Single(Some(father))
    );
    assert_eq!(
        collection(manager.get(&mut session, father, "children").unwrap()),
        vec![child]
    );
    assert!(manager.has_related(&mut session, father, "children", child).unwrap());
    assert!(manager.has_related(&mut session, child, "father", father).unwrap());
}

#[test]
fn test_many_to_many_symmetry_through_inherited_relation() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let dog = entity(&mut session, "Dog");

    // "dogs" is declared on Person; Father reaches it through its parent
    manager.add_related(&mut session, father, "dogs", dog).unwrap();

    assert!(manager.has_related(&mut session, father, "dogs", dog).unwrap());
    assert!(manager.has_related(&mut session, dog, "persons", father).unwrap());
}

#[test]
fn test_add_and_remove_are_idempotent() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let child = entity(&mut session, "Child");

    manager.add_related(&mut session, father, "children", child).unwrap();
    manager.add_related(&mut session, father, "children", child).unwrap();
    assert_eq!(
        collection(manager.get(&mut session, father, "children").unwrap()),
        vec![child]
    );

    manager.remove_related(&mut session, father, "children", child).unwrap();
    // removing an absent member succeeds without effect
    manager.remove_related(&mut session, father, "children", child).unwrap();
    assert!(collection(manager.get(&mut session, father, "children").unwrap()).is_empty());
    assert_eq!(
        manager.get(&mut session, child, "father").unwrap(),
        RelationValue::Single(None)
    );
}

#[test]
fn test_one_to_one_detaches_before_attaching() {
    let classes = ClassRegistry::new();
    classes
        .register(
            EntityClassDef::new("Citizen", "citizens").with_column("id").with_declaration(
                "passport",
                json!({
                    "type": "oneToOne",
                    "related.class": "Passport",
                    "related.property": "holder"
                }),
            ),
        )
        .unwrap();
    classes
        .register(
            EntityClassDef::new("Passport", "passports")
                .with_column("id")
                .with_declaration(
                    "holder",
                    json!({
                        "type": "oneToOne",
                        "related.class": "Citizen",
                        "related.property": "passport"
                    }),
                ),
        )
        .unwrap();
    let (manager, mut session) = setup(classes);
    let citizen = entity(&mut session, "Citizen");
    let first = entity(&mut session, "Passport");
    let second = entity(&mut session, "Passport");

    manager.set(&mut session, citizen, "passport", Some(first)).unwrap();
    manager.set(&mut session, citizen, "passport", Some(second)).unwrap();

    assert_eq!(
        manager.get(&mut session, citizen, "passport").unwrap(),
        RelationValue::Single(Some(second))
    );
    assert_eq!(
        manager.get(&mut session, first, "holder").unwrap(),
        RelationValue::Single(None)
    );
    assert_eq!(
        manager.get(&mut session, second, "holder").unwrap(),
        RelationValue::Single(Some(citizen))
    );
}

#[test]
fn test_self_referential_many_to_many_is_cycle_safe() {
    let classes = ClassRegistry::new();
    classes
        .register(
            EntityClassDef::new("Person", "persons").with_column("id").with_declaration(
                "friends",
                json!({"type": "manyToMany", "related.class": "Person"}),
            ),
        )
        .unwrap();
    let (manager, mut session) = setup(classes);
    let a = entity(&mut session, "Person");
    let b = entity(&mut session, "Person");

    manager.add_related(&mut session, a, "friends", b).unwrap();

    assert!(manager.has_related(&mut session, a, "friends", b).unwrap());
    assert!(manager.has_related(&mut session, b, "friends", a).unwrap());

    // syncing a mutually-referential pair terminates
    manager.sync_all(&mut session, a).unwrap();
    manager.sync_all(&mut session, b).unwrap();
    assert!(manager.has_related(&mut session, a, "friends", b).unwrap());
}

#[test]
fn test_junction_record_is_created_once_and_shared() {
    let (manager, mut session) = setup(junction_classes());
    let person = entity(&mut session, "Person");
    let dog = entity(&mut session, "Dog");

    manager.add_related(&mut session, person, "dogs", dog).unwrap();
    manager.add_related(&mut session, person, "dogs", dog).unwrap();
    manager.add_related(&mut session, dog, "persons", person).unwrap();

    let person_records =
        collection(manager.get(&mut session, person, "dog_person_relations").unwrap());
    let dog_records =
        collection(manager.get(&mut session, dog, "dog_person_relations").unwrap());
    assert_eq!(person_records.len(), 1);
    assert_eq!(person_records, dog_records);

    let record = person_records[0];
    assert!(manager.has_mid_relation(&mut session, person, "dogs", record).unwrap());
    assert!(manager.has_mid_relation(&mut session, dog, "persons", record).unwrap());

    // both accessors resolve to the related pair
    let junction = session.entity(record).unwrap();
    assert_eq!(
        junction.slot("person").and_then(RelationSlot::as_single),
        Some(Some(person))
    );
    assert_eq!(
        junction.slot("dog").and_then(RelationSlot::as_single),
        Some(Some(dog))
    );
}

#[test]
fn test_removing_orphans_the_junction_record() {
    let (manager, mut session) = setup(junction_classes());
    let person = entity(&mut session, "Person");
    let dog = entity(&mut session, "Dog");

    manager.add_related(&mut session, person, "dogs", dog).unwrap();
    let record =
        collection(manager.get(&mut session, person, "dog_person_relations").unwrap())[0];

    manager.remove_related(&mut session, person, "dogs", dog).unwrap();

    assert!(collection(manager.get(&mut session, person, "dogs").unwrap()).is_empty());
    assert!(collection(manager.get(&mut session, dog, "persons").unwrap()).is_empty());
    assert!(collection(
        manager.get(&mut session, person, "dog_person_relations").unwrap()
    )
    .is_empty());
    assert!(collection(manager.get(&mut session, dog, "dog_person_relations").unwrap()).is_empty());

    // the record survives detached, with its current-side accessor nulled
    let junction = session.entity(record).unwrap();
    assert_eq!(
        junction.slot("person").and_then(RelationSlot::as_single),
        Some(None)
    );
    assert_eq!(
        junction.slot("dog").and_then(RelationSlot::as_single),
        Some(Some(dog))
    );
}

#[test]
fn test_mid_relation_undefined_without_junction_config() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let dog = entity(&mut session, "Dog");

    let err = manager
        .has_mid_relation(&mut session, father, "dogs", dog)
        .unwrap_err();
    assert!(matches!(err, OrmError::MidRelationUndefined { .. }));
}

#[test]
fn test_type_mismatch_names_both_classes() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let dog = entity(&mut session, "Dog");

    let err = manager
        .add_related(&mut session, father, "children", dog)
        .unwrap_err();
    match err {
        OrmError::TypeMismatch {
            class,
            property,
            expected,
            found,
        } => {
            assert_eq!(class, "Father");
            assert_eq!(property, "children");
            assert_eq!(expected, "Child");
            assert_eq!(found, "Dog");
        }
        other => panic!("expected a type mismatch, got {}", other),
    }
}

#[test]
fn test_unknown_alias_is_relation_not_found() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let err = manager.get(&mut session, father, "pets").unwrap_err();
    assert!(matches!(err, OrmError::RelationNotFound { .. }));
}

#[test]
fn test_set_on_to_many_is_rejected() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let child = entity(&mut session, "Child");
    let err = manager
        .set(&mut session, father, "children", Some(child))
        .unwrap_err();
    assert!(err.to_string().contains("add/remove"));
}

#[test]
fn test_factory_return_type_is_validated() {
    let classes = junction_classes();
    // replace the factory result with an entity of the wrong class
    let broken = ClassRegistry::new();
    for name in ["Person", "Dog", "FamilyDog"] {
        let def = classes.get(name).unwrap();
        broken.register((*def).clone()).unwrap();
    }
    broken.register_factory("family_dog", |session, _context| {
        session.new_entity("Dog", Map::new())
    });

    let (manager, mut session) = setup(broken);
    let person = entity(&mut session, "Person");
    let dog = entity(&mut session, "Dog");

    let err = manager.add_related(&mut session, person, "dogs", dog).unwrap_err();
    match err {
        OrmError::FactoryCallback { cause, .. } => {
            assert!(cause.contains("'FamilyDog'"));
            assert!(cause.contains("'Dog'"));
        }
        other => panic!("expected a factory error, got {}", other),
    }
}

#[test]
fn test_sync_reestablishes_mirror_after_raw_write() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let child = entity(&mut session, "Child");

    // find the relation name and plant a raw collection, as hydration would
    manager.ensure_defined("Father").unwrap();
    let name = manager
        .registry()
        .resolve_alias("Father", "children")
        .unwrap()
        .relation_name()
        .to_string();
    let raw: RelatedCollection = [child].into_iter().collect();
    session
        .entity_mut(father)
        .unwrap()
        .set_slot(&name, RelationSlot::Many(raw));

    manager.initialize(&mut session, father).unwrap();

    assert_eq!(
        manager.get(&mut session, child, "father").unwrap(),
        RelationValue::Single(Some(father))
    );
}

#[test]
fn test_family_scenario_mirrors_every_side() {
    let (manager, mut session) = setup(family_classes());
    let father = entity(&mut session, "Father");
    let mother = entity(&mut session, "Mother");
    let child = entity(&mut session, "Child");
    let dog = entity(&mut session, "Dog");

    manager.set(&mut session, child, "father", Some(father)).unwrap();
    manager.set(&mut session, child, "mother", Some(mother)).unwrap();
    manager.add_related(&mut session, father, "dogs", dog).unwrap();
    manager.add_related(&mut session, child, "dogs", dog).unwrap();

    assert_eq!(
        collection(manager.get(&mut session, father, "children").unwrap()),
        vec![child]
    );
    assert_eq!(
        collection(manager.get(&mut session, mother, "children").unwrap()),
        vec![child]
    );

    let mut persons = collection(manager.get(&mut session, dog, "persons").unwrap());
    persons.sort();
    let mut expected = vec![father, child];
    expected.sort();
    assert_eq!(persons, expected);
}
