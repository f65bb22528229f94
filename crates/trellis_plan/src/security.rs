//! Security-rule property checks.
//!
//! CIDR-shaped values and ingress port ranges are checked before a graph
//! is frozen so malformed parameter input never reaches a plan. Values are
//! checked in their constant-folded form: a `Join` or `Sub` built only from
//! literals and parameters is checked as the text it will emit. Ingress
//! rules on one node must be unique by `(network, protocol, from, to)`.

use crate::graph::ResourceNode;
use crate::schema::TypeSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use trellis_core::{SynthError, SynthResult, Value};

/// Handling of duplicate ingress rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressMode {
    /// Fail with `InvalidPropertyValue`
    #[default]
    Strict,
    /// Keep the first occurrence, drop the rest
    Lenient,
}

const CIDR_KEYS: [&str; 2] = ["CidrIp", "CidrIpv6"];

/// Parse `address/prefix`
///
/// # Errors
///
/// Returns a reason when the text is not a CIDR block
pub fn parse_cidr(text: &str) -> Result<(IpAddr, u8), String> {
    let (address, prefix) = text
        .split_once('/')
        .ok_or_else(|| format!("'{text}' is not a CIDR block: missing prefix length"))?;
    let address: IpAddr = address
        .parse()
        .map_err(|_| format!("'{text}' is not a CIDR block: bad address"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("'{text}' is not a CIDR block: bad prefix length"))?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("'{text}' prefix length exceeds {max}"));
    }
    Ok((address, prefix))
}

/// Apply the security rules a schema declares to one node.
///
/// Returns the number of duplicate ingress rules dropped in lenient mode.
///
/// # Errors
///
/// Returns `InvalidPropertyValue` for a malformed CIDR or port, or for a
/// duplicate ingress rule in strict mode
pub fn enforce(node: &mut ResourceNode, schema: &TypeSchema, mode: IngressMode) -> SynthResult<usize> {
    for property in &schema.cidr_properties {
        if let Some(value) = node.properties.get(property) {
            check_cidr(node, property, value)?;
        }
    }

    let Some(property) = &schema.ingress_property else {
        return Ok(0);
    };
    let Some(Value::List(rules)) = node.properties.get(property) else {
        return Ok(0);
    };

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(rules.len());
    let mut dropped = 0;
    for (i, rule) in rules.iter().enumerate() {
        let path = format!("{property}[{i}]");
        let Some(key) = rule_key(node, &path, rule)? else {
            kept.push(rule.clone());
            continue;
        };
        if seen.insert(key.clone()) {
            kept.push(rule.clone());
            continue;
        }
        match mode {
            IngressMode::Strict => {
                return Err(SynthError::invalid(
                    &node.id,
                    path,
                    format!("duplicate ingress rule {}", key.describe()),
                ));
            }
            IngressMode::Lenient => {
                tracing::warn!(node = %node.id, rule = %key.describe(), "dropping duplicate ingress rule");
                dropped += 1;
            }
        }
    }

    if dropped > 0 {
        node.properties.insert(property.clone(), Value::List(kept));
    }
    Ok(dropped)
}

/// Parsed CIDR of a value, `None` when it is only known after materialization
fn check_cidr(node: &ResourceNode, path: &str, value: &Value) -> SynthResult<Option<(IpAddr, u8)>> {
    if let Some(scalar) = value.as_literal() {
        if scalar.as_str().is_none() {
            return Err(SynthError::invalid(&node.id, path, "CIDR block must be a string"));
        }
    }
    let Some(text) = value.constant_text() else {
        return Ok(None);
    };
    parse_cidr(&text)
        .map(Some)
        .map_err(|reason| SynthError::invalid(&node.id, path, reason))
}

fn check_port(node: &ResourceNode, path: &str, value: Option<&Value>) -> SynthResult<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let port = match value.as_literal() {
        Some(scalar) => scalar.as_int(),
        None => match value.constant_text() {
            Some(text) => text.parse().ok(),
            None => return Ok(None),
        },
    }
    .ok_or_else(|| SynthError::invalid(&node.id, path, "port must be an integer"))?;
    if !(-1..=65535).contains(&port) {
        return Err(SynthError::invalid(
            &node.id,
            path,
            format!("port {port} is outside 0..=65535"),
        ));
    }
    Ok(Some(port))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    address: IpAddr,
    prefix: u8,
    protocol: String,
    from: Option<i64>,
    to: Option<i64>,
}

impl RuleKey {
    fn describe(&self) -> String {
        let port = |p: Option<i64>| p.map_or_else(|| "?".to_string(), |p| p.to_string());
        format!(
            "({}/{}, {}, {}-{})",
            self.address,
            self.prefix,
            self.protocol,
            port(self.from),
            port(self.to)
        )
    }
}

/// Key of a literal ingress rule; `None` when the rule cannot be compared
/// until materialization
fn rule_key(node: &ResourceNode, path: &str, rule: &Value) -> SynthResult<Option<RuleKey>> {
    let entries = match rule {
        Value::Map(entries) => entries,
        Value::Reference(_) => return Ok(None),
        Value::Literal(_) | Value::List(_) => {
            return Err(SynthError::invalid(&node.id, path, "ingress rule must be a map"));
        }
    };

    let mut cidr = None;
    for key in CIDR_KEYS {
        if let Some(value) = entries.get(key) {
            let child = format!("{path}.{key}");
            cidr = check_cidr(node, &child, value)?;
        }
    }
    let from = check_port(node, &format!("{path}.FromPort"), entries.get("FromPort"))?;
    let to = check_port(node, &format!("{path}.ToPort"), entries.get("ToPort"))?;
    if let (Some(from), Some(to)) = (from, to) {
        if from >= 0 && to >= 0 && from > to {
            return Err(SynthError::invalid(
                &node.id,
                format!("{path}.FromPort"),
                format!("port range {from}-{to} is reversed"),
            ));
        }
    }

    let Some((address, prefix)) = cidr else {
        return Ok(None);
    };
    let protocol = entries
        .get("IpProtocol")
        .and_then(Value::constant_text)
        .unwrap_or_default()
        .to_ascii_lowercase();
    Ok(Some(RuleKey {
        address,
        prefix,
        protocol,
        from,
        to,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(cidr: &str, port: i64) -> Value {
        Value::map([
            ("CidrIp", Value::string(cidr)),
            ("IpProtocol", Value::string("tcp")),
            ("FromPort", Value::int(port)),
            ("ToPort", Value::int(port)),
        ])
    }

    fn group(rules: Vec<Value>) -> ResourceNode {
        ResourceNode::new("WebserverSG", "AWS::EC2::SecurityGroup")
            .with_property("SecurityGroupIngress", Value::List(rules))
    }

    fn schema() -> TypeSchema {
        TypeSchema::opaque("AWS::EC2::SecurityGroup")
            .with_ingress("SecurityGroupIngress")
            .with_cidr("CidrBlock")
    }

    #[test]
    fn test_parse_cidr() {
        assert!(parse_cidr("0.0.0.0/0").is_ok());
        assert!(parse_cidr("10.0.0.0/16").is_ok());
        assert!(parse_cidr("2001:db8::/32").is_ok());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("300.0.0.0/8").is_err());
        assert!(parse_cidr("2001:db8::/129").is_err());
        assert!(parse_cidr("YourIP/32").is_err());
    }

    #[test]
    fn test_distinct_rules_pass() {
        let mut node = group(vec![rule("1.2.3.4/32", 22), rule("0.0.0.0/0", 80)]);
        assert_eq!(enforce(&mut node, &schema(), IngressMode::Strict).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_rule_strict() {
        let mut node = group(vec![rule("0.0.0.0/0", 80), rule("0.0.0.0/0", 80)]);
        let err = enforce(&mut node, &schema(), IngressMode::Strict).unwrap_err();
        match err {
            SynthError::InvalidPropertyValue { node, property, .. } => {
                assert_eq!(node.as_str(), "WebserverSG");
                assert_eq!(property, "SecurityGroupIngress[1]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_rule_lenient_keeps_first() {
        let mut node = group(vec![
            rule("0.0.0.0/0", 80),
            rule("1.2.3.4/32", 22),
            rule("0.0.0.0/0", 80),
        ]);
        assert_eq!(enforce(&mut node, &schema(), IngressMode::Lenient).unwrap(), 1);
        let rules = node.properties["SecurityGroupIngress"].as_list().unwrap();
        assert_eq!(rules, &[rule("0.0.0.0/0", 80), rule("1.2.3.4/32", 22)]);
    }

    #[test]
    fn test_protocol_distinguishes_rules() {
        let udp = Value::map([
            ("CidrIp", Value::string("0.0.0.0/0")),
            ("IpProtocol", Value::string("udp")),
            ("FromPort", Value::int(80)),
            ("ToPort", Value::int(80)),
        ]);
        let mut node = group(vec![rule("0.0.0.0/0", 80), udp]);
        assert_eq!(enforce(&mut node, &schema(), IngressMode::Strict).unwrap(), 0);
    }

    #[test]
    fn test_malformed_cidr_rejected() {
        let mut node = group(vec![rule("YourIP/32", 22)]);
        let err = enforce(&mut node, &schema(), IngressMode::Lenient).unwrap_err();
        assert!(matches!(err, SynthError::InvalidPropertyValue { ref property, .. } if property == "SecurityGroupIngress[0].CidrIp"));
    }

    #[test]
    fn test_port_out_of_range() {
        let mut node = group(vec![rule("0.0.0.0/0", 70000)]);
        assert!(enforce(&mut node, &schema(), IngressMode::Strict).is_err());
    }

    #[test]
    fn test_reversed_port_range() {
        let rule = Value::map([
            ("CidrIp", Value::string("0.0.0.0/0")),
            ("IpProtocol", Value::string("tcp")),
            ("FromPort", Value::int(443)),
            ("ToPort", Value::int(80)),
        ]);
        let mut node = group(vec![rule]);
        assert!(enforce(&mut node, &schema(), IngressMode::Strict).is_err());
    }

    #[test]
    fn test_cidr_property_checked() {
        let mut vpc = ResourceNode::new("VPC", "AWS::EC2::VPC")
            .with_property("CidrBlock", Value::string("10.0.0.0/99"));
        assert!(enforce(&mut vpc, &schema(), IngressMode::Strict).is_err());
    }

    #[test]
    fn test_deferred_values_skipped() {
        let mut vpc = ResourceNode::new("Subnet", "AWS::EC2::Subnet")
            .with_property("CidrBlock", Value::get_att("VPC", "CidrBlock"));
        assert!(enforce(&mut vpc, &schema(), IngressMode::Strict).is_ok());
    }

    #[test]
    fn test_folded_sub_cidr_rejected() {
        let spliced = Value::map([
            ("CidrIp", Value::sub("not-an-ip/99")),
            ("IpProtocol", Value::string("tcp")),
            ("FromPort", Value::int(22)),
            ("ToPort", Value::int(22)),
        ]);
        let mut node = group(vec![spliced]);
        let err = enforce(&mut node, &schema(), IngressMode::Strict).unwrap_err();
        assert!(matches!(err, SynthError::InvalidPropertyValue { ref property, .. } if property == "SecurityGroupIngress[0].CidrIp"));
    }

    #[test]
    fn test_folded_join_duplicates_literal() {
        let joined = Value::map([
            ("CidrIp", Value::join("", [Value::string("0.0.0.0"), Value::string("/0")])),
            ("IpProtocol", Value::string("tcp")),
            ("FromPort", Value::int(80)),
            ("ToPort", Value::int(80)),
        ]);
        let mut node = group(vec![joined, rule("0.0.0.0/0", 80)]);
        let err = enforce(&mut node, &schema(), IngressMode::Strict).unwrap_err();
        assert!(matches!(err, SynthError::InvalidPropertyValue { ref property, .. } if property == "SecurityGroupIngress[1]"));
    }

    #[test]
    fn test_ipv6_case_is_one_rule() {
        let v6 = |cidr: &str| {
            Value::map([
                ("CidrIpv6", Value::string(cidr)),
                ("IpProtocol", Value::string("tcp")),
                ("FromPort", Value::int(443)),
                ("ToPort", Value::int(443)),
            ])
        };
        let mut node = group(vec![v6("2001:DB8::/32"), v6("2001:db8::/32")]);
        assert_eq!(enforce(&mut node, &schema(), IngressMode::Lenient).unwrap(), 1);
        assert_eq!(node.properties["SecurityGroupIngress"].as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_non_string_cidr_rejected() {
        let mut vpc = ResourceNode::new("VPC", "AWS::EC2::VPC").with_property("CidrBlock", Value::int(10));
        assert!(enforce(&mut vpc, &schema(), IngressMode::Strict).is_err());
    }
}
